use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChatState {
    #[default]
    Unknown = 0,
    Idle = 1,
    Connecting = 2,
    Listening = 3,
    Speaking = 4,
    Upgrading = 5,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Unknown => "unknown",
            ChatState::Idle => "idle",
            ChatState::Connecting => "connecting",
            ChatState::Listening => "listening",
            ChatState::Speaking => "speaking",
            ChatState::Upgrading => "upgrading",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ChatState::Idle,
            2 => ChatState::Connecting,
            3 => ChatState::Listening,
            4 => ChatState::Speaking,
            5 => ChatState::Upgrading,
            _ => ChatState::Unknown,
        }
    }
}

impl fmt::Display for ChatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
