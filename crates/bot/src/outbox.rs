use anyhow::{Context as _, Result};
use async_trait::async_trait;
use matrix_sdk::{
    Client,
    ruma::{UserId, events::room::message::RoomMessageEventContent},
};
use responder_core::{Outbox, truncate};
use tracing::{debug, info};

/// Delivers action output as direct messages, creating the DM room on first use.
#[derive(Debug, Clone)]
pub(crate) struct MatrixOutbox {
    client: Client,
}

impl MatrixOutbox {
    pub(crate) const fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Outbox for MatrixOutbox {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<()> {
        let user_id = UserId::parse(recipient)
            .with_context(|| format!("invalid recipient user id {recipient}"))?;
        let room = if let Some(room) = self.client.get_dm_room(&user_id) {
            room
        } else {
            info!(recipient, "Creating direct message room");
            self.client
                .create_dm(&user_id)
                .await
                .with_context(|| format!("creating DM room with {recipient}"))?
        };
        room.send(RoomMessageEventContent::text_plain(text))
            .await
            .with_context(|| format!("sending DM to {recipient}"))?;
        debug!(recipient, room_id = %room.room_id(), body = %truncate(text, 200), "Sent direct message");
        Ok(())
    }
}
