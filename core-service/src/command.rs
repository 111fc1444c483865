//! Chat commands, already parsed by the chat client.

use bridge_traits::{ChatId, UserId};
use core_queue::LoopMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    /// Resolve and enqueue the audio variant.
    Play { query: String },
    /// Resolve and enqueue the video variant.
    PlayVideo { query: String },
    /// Expand a playlist and enqueue up to `MAX_PLAYLIST_SIZE` entries.
    Playlist { query: String },
    Skip,
    Pause,
    Resume,
    Queue,
    NowPlaying,
    /// Seek to a time string (`90`, `1:30`, `1:02:03`, `90s`, `5m`).
    Seek { time: String },
    Volume { level: u16 },
    Loop { mode: LoopMode },
    Shuffle,
    /// 1-based queue position.
    Remove { position: usize },
    Move { from: usize, to: usize },
    Stop,
    History,
    ClearTemp,
    Ban { user: UserId },
    Unban { user: UserId },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Play { .. } => "play",
            CommandKind::PlayVideo { .. } => "vplay",
            CommandKind::Playlist { .. } => "playlist",
            CommandKind::Skip => "skip",
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Queue => "queue",
            CommandKind::NowPlaying => "nowplaying",
            CommandKind::Seek { .. } => "seek",
            CommandKind::Volume { .. } => "volume",
            CommandKind::Loop { .. } => "loop",
            CommandKind::Shuffle => "shuffle",
            CommandKind::Remove { .. } => "remove",
            CommandKind::Move { .. } => "move",
            CommandKind::Stop => "stop",
            CommandKind::History => "history",
            CommandKind::ClearTemp => "cleartemp",
            CommandKind::Ban { .. } => "ban",
            CommandKind::Unban { .. } => "unban",
        }
    }

    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            CommandKind::Stop
                | CommandKind::ClearTemp
                | CommandKind::Ban { .. }
                | CommandKind::Unban { .. }
        )
    }

    /// Commands that only read state and never create a session.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            CommandKind::Queue | CommandKind::NowPlaying | CommandKind::History
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub chat_id: ChatId,
    pub user: UserId,
    pub is_admin: bool,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl Command {
    pub fn new(chat_id: ChatId, user: UserId, kind: CommandKind) -> Self {
        Self {
            chat_id,
            user,
            is_admin: false,
            kind,
        }
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// What the chat was told.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub chat_id: ChatId,
    pub message: String,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_only_commands() {
        assert!(CommandKind::Stop.requires_admin());
        assert!(CommandKind::ClearTemp.requires_admin());
        assert!(CommandKind::Ban { user: UserId::new(1) }.requires_admin());
        assert!(!CommandKind::Skip.requires_admin());
        assert!(!CommandKind::Volume { level: 50 }.requires_admin());
    }

    #[test]
    fn test_command_json_shape() {
        let command = Command::new(
            ChatId::new(-5),
            UserId::new(9),
            CommandKind::Seek {
                time: "1:30".to_string(),
            },
        );
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "seek");
        assert_eq!(json["time"], "1:30");
        assert_eq!(json["is_admin"], false);

        let parsed: Command = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, command);
    }
}
