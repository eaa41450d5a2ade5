use std::io::Write;
use std::sync::Once;

use plexus_core::sync_guard::in_handler;
use plexus_protocol::{Channel, Frame, PluginState, StatusFrame};

use crate::dispatch::panic_message;

static INSTALL: Once = Once::new();

/// Reports a final `crashed` status for panics outside handler scopes, then
/// defers to the previous hook. Handler panics are caught by the dispatcher
/// and reported as failed results instead.
pub fn install_crash_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !in_handler() {
                let message = panic_message(info.payload());
                let location = info
                    .location()
                    .map(|l| format!("{}:{}", l.file(), l.line()))
                    .unwrap_or_default();
                let status = StatusFrame::new(
                    PluginState::Crashed,
                    Some(format!("{message} at {location}")),
                );
                // written directly: the writer thread may be the one panicking
                if let Ok(line) = Frame::new(Channel::Status, &status).and_then(|f| f.encode()) {
                    let mut out = std::io::stdout().lock();
                    let _ = writeln!(out, "{line}");
                    let _ = out.flush();
                }
            }
            previous(info);
        }));
    });
}
