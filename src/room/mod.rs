//! Real-time media room collaborator.
//!
//! A provider joins a room and hands back the outbound connection plus the
//! inbound event stream. Events are routed through [`RoomEventRouter`], a
//! table built once when the session starts.

mod dispatch;
pub mod loopback;

pub use dispatch::{Dispatch, RoomEventRouter, RouterExit};
pub use loopback::{LoopbackProvider, LoopbackRoom};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room connection closed")]
    Closed,
    #[error("room rejected request: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug)]
pub enum RoomEvent {
    FrameReceived(AudioFrame),
    ParticipantDisconnected { identity: String },
    DataMessage { topic: String, payload: Bytes },
}

impl RoomEvent {
    pub const FRAME_RECEIVED: &'static str = "frame_received";
    pub const PARTICIPANT_DISCONNECTED: &'static str = "participant_disconnected";
    pub const DATA_MESSAGE: &'static str = "data_message";

    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::FrameReceived(_) => Self::FRAME_RECEIVED,
            RoomEvent::ParticipantDisconnected { .. } => Self::PARTICIPANT_DISCONNECTED,
            RoomEvent::DataMessage { .. } => Self::DATA_MESSAGE,
        }
    }
}

/// Outbound side of a joined room. Frame and data publishing must not block;
/// the output loop calls `push_frame` once per tick.
#[async_trait]
pub trait RoomConnection: Send + Sync {
    fn push_frame(&self, frame: AudioFrame) -> Result<(), RoomError>;

    fn send_data(&self, topic: &str, payload: Bytes) -> Result<(), RoomError>;

    async fn disconnect(&self) -> Result<(), RoomError>;
}

pub struct RoomSession {
    pub connection: Arc<dyn RoomConnection>,
    pub events: mpsc::Receiver<RoomEvent>,
}

#[async_trait]
pub trait RoomProvider: Send + Sync {
    async fn join(&self, room_id: &str, token: &str) -> Result<RoomSession>;
}
