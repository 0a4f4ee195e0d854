//! Ready-made interceptor that writes every notification to stderr.

use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use super::intercept::Intercept;
use super::scope::InterceptorScope;
use crate::machine::Machine;
use crate::notifications::Notification;

/// Writes one line per notification to stderr.
///
/// Line shape:
/// `<unix_ms> <label> seq=<n> [item=<id>] [key=<key>] [detail=<text>]`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWriter;

#[async_trait]
impl<M: Machine> Intercept<M> for LogWriter {
    fn name(&self) -> &str {
        "log_writer"
    }

    async fn on_notification(&self, _scope: &InterceptorScope<M>, note: Notification<M>) {
        let at_ms = note
            .at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut line = format!("{at_ms} {} seq={}", note.kind.label(), note.seq);
        if let Some(item) = note.item {
            line.push_str(&format!(" item={item}"));
        }
        if let Some(key) = &note.key {
            line.push_str(&format!(" key={key}"));
        }
        if let Some(detail) = &note.detail {
            line.push_str(&format!(" detail={detail}"));
        }
        eprintln!("{line}");
    }
}
