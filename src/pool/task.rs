use crate::db::UserStore;

/// Operation a reactor-mode task asks the worker to perform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Pending {
    Read = 0,
    Write = 1,
}

impl Pending {
    pub fn from_u8(v: u8) -> Self {
        if v == Pending::Write as u8 {
            Pending::Write
        } else {
            Pending::Read
        }
    }
}

/// What the worker pool needs from the things it runs.
///
/// Implementors are shared between the event loop and the pool, hence
/// `&self` everywhere. A new task for an implementor is only queued once
/// the previous one re-armed its socket.
pub trait Task: Send + Sync + 'static {
    /// Record the operation a reactor-mode worker should perform.
    fn set_pending(&self, op: Pending);
    fn pending(&self) -> Pending;

    /// Pull available bytes off the socket. False means close.
    fn read_once(&self) -> bool;

    /// Push the prepared response. False means close.
    fn write(&self) -> bool;

    /// Parse what is buffered and prepare the response.
    fn process(&self, db: Option<&mut dyn UserStore>);

    /// The worker is done with this task; the event loop may act on it.
    /// Called exactly once per dequeued task.
    fn mark_finished(&self);

    /// The operation failed; the connection should be evicted.
    fn mark_failed(&self);
}
