use crate::directory::IdentityDirectory;
use crate::station::{StationError, StationHandle};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for one attendance station.
///
/// Bus name: org.rollgate.Station1
/// Object path: /org/rollgate/Station1
pub struct StationService {
    pub handle: StationHandle,
    pub directory: Arc<IdentityDirectory>,
}

fn to_fdo(e: StationError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollgate.Station1")]
impl StationService {
    /// Feed a card scan as if it came from the reader and wait for the verdict.
    ///
    /// Returns the verdict report as JSON.
    async fn scan(&self, card_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(card = card_id, "scan requested over D-Bus");
        let report = self.handle.scan(card_id).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Abandon the open session. False when nothing was open.
    async fn cancel(&self) -> zbus::fdo::Result<bool> {
        Ok(self.handle.cancel().await)
    }

    /// Session state, health and local queue depths.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let mut status = serde_json::to_value(self.handle.status())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if let Some(map) = status.as_object_mut() {
            map.insert("version".into(), env!("CARGO_PKG_VERSION").into());
            map.insert("cached_identities".into(), self.directory.cached_len().into());
        }
        Ok(status.to_string())
    }

    /// The most recent verdicts, newest first.
    async fn last_verdicts(&self, count: u32) -> zbus::fdo::Result<String> {
        to_json(&self.handle.last_verdicts(count as usize))
    }

    async fn pending_ledger_count(&self) -> zbus::fdo::Result<u32> {
        self.handle
            .pending_ledger_count()
            .map(|n| n as u32)
            .ok_or_else(|| zbus::fdo::Error::Failed("ledger queue unreadable".into()))
    }

    async fn pending_evidence_count(&self) -> zbus::fdo::Result<u32> {
        self.handle
            .pending_evidence_count()
            .map(|n| n as u32)
            .ok_or_else(|| zbus::fdo::Error::Failed("evidence queue unreadable".into()))
    }

    /// Drop a cached directory entry after enrollment data changed.
    async fn invalidate_card(&self, card_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(card = card_id, "directory invalidation requested");
        Ok(self.directory.invalidate(card_id))
    }

    /// Clear a station fault. False when the station was not faulted.
    async fn resume(&self) -> zbus::fdo::Result<bool> {
        Ok(self.handle.resume())
    }
}
