mod config;
mod gateway;
mod logging;
mod outbox;

use core::time::Duration;
use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::{Result, anyhow};
use clap::Parser;
use matrix_sdk::{
    Client,
    config::SyncSettings,
    room::Room,
    ruma::events::room::message::{
        MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent,
    },
};
use responder_actions::ActionBook;
use responder_core::{
    ActionRegistrar, AdminPolicy, MessageRouter, Outbox, ResponseStore, truncate,
};
use tracing::{debug, info, warn};

use crate::{
    config::{load_config, write_template},
    gateway::ConnectOptions,
    logging::init_tracing,
    outbox::MatrixOutbox,
};

#[derive(Parser, Debug)]
#[command(
    name = "matrix-responder-bot",
    version,
    about = "Matrix auto-responder bot with admin-managed replies"
)]
struct Args {
    /// Path to the YAML config file
    #[arg(long, env = "RESPONDER_CONFIG", default_value = "./config.yaml")]
    config: PathBuf,

    /// Homeserver base URL, e.g. `https://matrix-client.matrix.org`.
    #[arg(long, env = "RESPONDER_HOMESERVER")]
    homeserver: Option<String>,

    /// Username (localpart or full user ID)
    #[arg(long, env = "RESPONDER_USERNAME")]
    username: Option<String>,

    /// Password (if omitted, will prompt if needed)
    #[arg(long, env = "RESPONDER_PASSWORD")]
    password: Option<String>,

    /// Directory for persistent state (encryption keys, sync cache)
    #[arg(long, env = "RESPONDER_STORE", default_value = "./bot-store")]
    store: PathBuf,

    /// JSON session file for access token/device info
    #[arg(long, env = "RESPONDER_SESSION_FILE", default_value = "./session.json")]
    session_file: PathBuf,

    /// Auto-confirm SAS verifications (insecure for production)
    #[arg(long, env = "RESPONDER_AUTO_VERIFY", default_value_t = false)]
    auto_verify: bool,

    /// Sync timeout in milliseconds
    #[arg(long, env = "RESPONDER_SYNC_TIMEOUT_MS", default_value_t = 30000)]
    sync_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    // Load .env if present so clap and RUST_LOG can pick up env vars.
    let _ = dotenvy::dotenv();
    init_tracing();
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let Some(credentials) = config.credentials(
        args.homeserver.as_deref(),
        args.username.as_deref(),
        args.password.as_deref(),
    ) else {
        let written = write_template(&args.config)?;
        return Err(anyhow!(
            "homeserver and username must be set in {} or via RESPONDER_HOMESERVER/RESPONDER_USERNAME (template at {})",
            args.config.display(),
            written.display()
        ));
    };

    let persist_timeout = Duration::from_millis(config.persist_timeout_ms);
    let client = gateway::connect(ConnectOptions {
        credentials: &credentials,
        store: &args.store,
        session_file: &args.session_file,
        device_name: &config.device_name,
        write_timeout: persist_timeout,
    })
    .await?;
    let took_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(user = ?client.user_id(), took_ms, "Logged in");

    let policy = Arc::new(AdminPolicy::new(&config.admins));
    if policy.is_empty() {
        warn!("Admin list is empty; nobody can manage responses");
    }
    let store = ResponseStore::open(&config.responses_file, persist_timeout).await?;
    let outbox: Arc<dyn Outbox> = Arc::new(MatrixOutbox::new(client.clone()));
    let actions: Arc<dyn ActionRegistrar> = Arc::new(
        ActionBook::open(
            &config.actions_file,
            persist_timeout,
            outbox,
            Arc::clone(&policy),
        )
        .await?,
    );
    let router = MessageRouter::new(store, policy, actions);

    if config.autoaccept {
        info!("Auto-accepting room invites");
        gateway::enable_autojoin(&client);
    }
    gateway::enable_verification(&client, args.auto_verify);

    client.add_event_handler(
        move |ev: OriginalSyncRoomMessageEvent, room: Room, client: Client| {
            let router = router.clone();
            async move { on_room_message(&router, ev, room, &client).await }
        },
    );

    info!(
        timeout_ms = args.sync_timeout_ms,
        "Starting sync… Press Ctrl+C to stop."
    );
    let settings = SyncSettings::new().timeout(Duration::from_millis(args.sync_timeout_ms));
    client
        .sync(settings)
        .await
        .map_err(|e| anyhow!("sync terminated: {e}"))
}

async fn on_room_message(
    router: &MessageRouter,
    ev: OriginalSyncRoomMessageEvent,
    room: Room,
    client: &Client,
) {
    let Some(own_id) = client.user_id() else {
        return;
    };
    if ev.sender == own_id {
        return;
    }
    let body = match &ev.content.msgtype {
        MessageType::Text(t) => t.body.as_str(),
        MessageType::Notice(n) => n.body.as_str(),
        MessageType::Audio(_)
        | MessageType::Emote(_)
        | MessageType::File(_)
        | MessageType::Image(_)
        | MessageType::Location(_)
        | MessageType::ServerNotice(_)
        | MessageType::Video(_)
        | MessageType::VerificationRequest(_)
        | _ => return,
    };
    let text = body.trim();
    debug!(room_id = %room.room_id(), sender = %ev.sender, body = %truncate(text, 200), "Incoming message");

    for reply in router.dispatch(ev.sender.as_str(), text).await {
        if let Err(e) = room
            .send(RoomMessageEventContent::text_plain(reply))
            .await
        {
            warn!(error = %e, room_id = %room.room_id(), sender = %ev.sender, "Failed to send reply");
        }
    }
}
