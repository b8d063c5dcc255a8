//! Host environment signals that trigger background refresh.

use tokio::sync::broadcast;

/// An environment change worth re-checking observed endpoints for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  /// The host became visible or focused again
  VisibilityRegained,
  /// Network connectivity came back
  ConnectivityRegained,
}

/// Broadcaster the host uses to emit [`Signal`]s to started engines.
///
/// Clones share the same channel.
#[derive(Debug, Clone)]
pub struct Signals {
  tx: broadcast::Sender<Signal>,
}

impl Signals {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(16);
    Self { tx }
  }

  pub fn emit(&self, signal: Signal) {
    // No started engine means nobody to notify
    let _ = self.tx.send(signal);
  }

  pub fn visibility_regained(&self) {
    self.emit(Signal::VisibilityRegained);
  }

  pub fn connectivity_regained(&self) {
    self.emit(Signal::ConnectivityRegained);
  }

  /// Number of engines currently listening.
  pub fn listener_count(&self) -> usize {
    self.tx.receiver_count()
  }

  pub(crate) fn listen(&self) -> broadcast::Receiver<Signal> {
    self.tx.subscribe()
  }
}

impl Default for Signals {
  fn default() -> Self {
    Self::new()
  }
}
