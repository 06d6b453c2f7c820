//! Operator-class command rejections.
//!
//! These never change [`crate::state::MachineState`]; the offending request
//! is answered with a code and dropped. Alarms live in [`crate::alarm`].

use thiserror::Error;

/// Rejection returned to the command layer when a request is not legal in
/// the current state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// The operation requires the machine to be idle.
    #[error("machine must be idle")]
    IdleStateRequired,
    /// The machine is alarm-locked; home or reset first.
    #[error("alarm lock active")]
    AlarmLock,
    /// The safety door is open; close it before resuming.
    #[error("safety door is ajar")]
    CheckDoor,
    /// Homing was requested but is disabled in the configuration.
    #[error("homing is not enabled")]
    HomingNotEnabled,
    /// A system abort is pending; the request cannot be serviced.
    #[error("system abort in progress")]
    SystemAbort,
    /// The motion queue has no room for another block.
    #[error("motion queue is full")]
    QueueFull,
}
