//! Event definitions for the application event loop.
//!
//! Terminal input, OS signals and the health probe all feed one channel. Server output
//! does not go through here; the supervisor keeps its own queue that the loop drains on
//! every tick.

use crossterm::event::KeyEvent;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// The health probe for run `run` got its first 200.
    ServerReady { run: u64 },
    /// The process was asked to exit by the OS.
    Shutdown { signal: ShutdownSignal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "interrupt",
            ShutdownSignal::Terminate => "terminate",
        }
    }
}
