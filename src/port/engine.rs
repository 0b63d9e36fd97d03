use super::instance::Instance;

/// Hooks the porting layer invokes on the protocol engine.
///
/// Each hook receives the instance that triggered it, so the engine can
/// call back into the port (`serial_get_byte`, `serial_put_byte`,
/// `serial_enable`, `event_post`, `timer_enable`, ...) from inside the hook.
pub trait EngineCallbacks {
    /// One byte is ready to be taken with [`Instance::serial_get_byte`].
    fn byte_received(&mut self, _port: &mut Instance) {}

    /// The transmitter wants the next byte. The engine either pushes one
    /// with [`Instance::serial_put_byte`] or leaves transmitter mode.
    ///
    /// The default leaves transmitter mode immediately.
    fn transmitter_empty(&mut self, port: &mut Instance) {
        port.serial_enable(false, false);
    }

    /// The instance's timer expired and was disarmed.
    fn timer_expired(&mut self, _port: &mut Instance) {}
}

/// Engine that ignores every hook; useful for TCP-only loops and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEngine;

impl EngineCallbacks for NoOpEngine {}
