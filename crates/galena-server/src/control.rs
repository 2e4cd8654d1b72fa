//! Operator control surface: backups, status probes, runtime tunables.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use galena_types::{ClockTime, ConfigKind, StatusKind};
use galena_wire::{Response, StatusValue};

use crate::node::ServerNode;

impl ServerNode {
    pub(crate) fn handle_create_backup(&self, suffix: &str) -> Response {
        match self.store.backup(suffix) {
            Ok(path) => {
                info!(path = %path.display(), "backup created");
                Response::CreateBackup { ok: true }
            }
            Err(e) => {
                error!(error = %e, "backup failed");
                Response::CreateBackup { ok: false }
            }
        }
    }

    pub(crate) fn handle_get_status(&self, command: StatusKind) -> Response {
        let value = match command {
            StatusKind::Pid => StatusValue::U64(u64::from(std::process::id())),
            StatusKind::Uptime => StatusValue::U64(self.metrics.uptime_secs()),
            StatusKind::Time => StatusValue::U64(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs()),
            ),
            StatusKind::Version => StatusValue::Text(env!("CARGO_PKG_VERSION").to_string()),
            StatusKind::CmdGet => StatusValue::U64(self.metrics.cmd_get()),
            StatusKind::CmdSet => StatusValue::U64(self.metrics.cmd_set()),
            StatusKind::CmdDelete => StatusValue::U64(self.metrics.cmd_delete()),
            StatusKind::DbItems => StatusValue::U64(self.store.items()),
            StatusKind::ClockTime => StatusValue::Stamp(ClockTime::now(self.clock.get())),
            StatusKind::Rhs => StatusValue::Seed(self.spaces.rhs().seed()),
            StatusKind::Whs => StatusValue::Seed(self.spaces.whs().seed()),
        };
        Response::GetStatus(value)
    }

    pub(crate) fn handle_set_config(&self, command: ConfigKind, arg: bool) -> Response {
        match command {
            ConfigKind::TcpNodelay => {
                info!(arg, "tcp_nodelay reconfigured");
                self.tcp_nodelay.store(arg, Ordering::Relaxed);
            }
        }
        Response::SetConfig
    }
}
