use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManualDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ChannelStatus::Enabled)
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManualDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            2 => ChannelStatus::ManualDisabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::Enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Enabled,
    Disabled,
}

impl UserStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            UserStatus::Enabled => 1,
            UserStatus::Disabled => 2,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        if value == 2 {
            UserStatus::Disabled
        } else {
            UserStatus::Enabled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            2 => TokenStatus::Disabled,
            3 => TokenStatus::Expired,
            4 => TokenStatus::Exhausted,
            _ => TokenStatus::Enabled,
        }
    }
}
