use bitflags::bitflags;

bitflags! {
    /// Flags byte carried by `CanMessage` and `PeriodicUpdate` events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        const EXTENDED = 0x1;
        const REMOTE = 0x2;
        const ERROR = 0x4;
    }
}

impl FrameFlags {
    pub fn from_message(msg: &crate::Message) -> Self {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::EXTENDED, msg.is_extended_id);
        flags.set(FrameFlags::REMOTE, msg.is_remote_frame);
        flags.set(FrameFlags::ERROR, msg.is_error_frame);
        flags
    }
}
