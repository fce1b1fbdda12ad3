//! Matrix session handling: login or restore, invites and device verification.

use core::time::Duration;
use std::{io::IsTerminal as _, path::Path};

use anyhow::{Context as _, Result, anyhow};
use futures_util::StreamExt as _;
use matrix_sdk::{
    Client, SessionMeta,
    authentication::{SessionTokens, matrix::MatrixSession},
    encryption::verification::{
        SasState, SasVerification, Verification, VerificationRequest, VerificationRequestState,
    },
    room::Room,
    ruma::{
        OwnedDeviceId, OwnedUserId,
        events::{
            key::verification::{
                request::ToDeviceKeyVerificationRequestEvent,
                start::ToDeviceKeyVerificationStartEvent,
            },
            room::{
                member::{MembershipState, StrippedRoomMemberEvent},
                message::{MessageType, OriginalSyncRoomMessageEvent},
            },
        },
    },
};
use responder_core::persist;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Credentials;

/// Login state written after a password login so restarts skip the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedSession {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl From<SavedSession> for MatrixSession {
    fn from(saved: SavedSession) -> Self {
        Self {
            meta: SessionMeta {
                user_id: saved.user_id,
                device_id: saved.device_id,
            },
            tokens: SessionTokens {
                access_token: saved.access_token,
                refresh_token: saved.refresh_token,
            },
        }
    }
}

impl From<MatrixSession> for SavedSession {
    fn from(session: MatrixSession) -> Self {
        Self {
            user_id: session.meta.user_id,
            device_id: session.meta.device_id,
            access_token: session.tokens.access_token,
            refresh_token: session.tokens.refresh_token,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConnectOptions<'a> {
    pub(crate) credentials: &'a Credentials,
    pub(crate) store: &'a Path,
    pub(crate) session_file: &'a Path,
    pub(crate) device_name: &'a str,
    pub(crate) write_timeout: Duration,
}

/// Build a client backed by the SQLite store and either restore the saved
/// session or log in with a password.
pub(crate) async fn connect(opts: ConnectOptions<'_>) -> Result<Client> {
    tokio::fs::create_dir_all(opts.store)
        .await
        .with_context(|| format!("creating store directory at {}", opts.store.display()))?;

    let client = Client::builder()
        .homeserver_url(&opts.credentials.homeserver)
        .handle_refresh_tokens()
        .sqlite_store(opts.store, None)
        .build()
        .await
        .context("building matrix client")?;

    if let Some(saved) = persist::read_json::<SavedSession>(opts.session_file).await? {
        info!(user = %saved.user_id, device = %saved.device_id, "Restoring session");
        client
            .restore_session(MatrixSession::from(saved))
            .await
            .context("restoring session")?;
        return Ok(client);
    }

    let password = match &opts.credentials.password {
        Some(p) => p.clone(),
        None => prompt_password(opts.session_file)?,
    };
    info!(user = %opts.credentials.username, "Logging in");
    client
        .matrix_auth()
        .login_username(&opts.credentials.username, &password)
        .initial_device_display_name(opts.device_name)
        .request_refresh_token()
        .send()
        .await
        .context("login failed")?;

    let session = client
        .matrix_auth()
        .session()
        .context("login returned no session")?;
    let saved = SavedSession::from(session);
    persist::write_json_atomic(opts.session_file, &saved, opts.write_timeout).await?;
    info!(user = %saved.user_id, device = %saved.device_id, file = %opts.session_file.display(), "Session saved");
    Ok(client)
}

fn prompt_password(session_file: &Path) -> Result<String> {
    if !std::io::stdin().is_terminal() {
        return Err(anyhow!(
            "no password configured and no saved session at {}; set RESPONDER_PASSWORD or run interactively once",
            session_file.display()
        ));
    }
    #[cfg(feature = "rpassword")]
    {
        rpassword::prompt_password("Matrix password: ")
            .map_err(|e| anyhow!("reading password: {e}"))
    }
    #[cfg(not(feature = "rpassword"))]
    {
        Err(anyhow!(
            "built without the rpassword feature; set RESPONDER_PASSWORD"
        ))
    }
}

/// Join every room the bot is invited to.
pub(crate) fn enable_autojoin(client: &Client) {
    client.add_event_handler(|ev: StrippedRoomMemberEvent, room: Room, client: Client| async move {
        let invited_us = ev.content.membership == MembershipState::Invite
            && client.user_id().is_some_and(|me| ev.state_key == me);
        if !invited_us {
            return;
        }
        info!(room_id = %room.room_id(), inviter = %ev.sender, "Accepting invite");
        if let Err(e) = room.join().await {
            warn!(error = %e, room_id = %room.room_id(), "Failed to accept invite");
        }
    });
}

/// Accept incoming emoji (SAS) verifications. The emojis are logged; with
/// `auto_confirm` they are also confirmed.
pub(crate) fn enable_verification(client: &Client, auto_confirm: bool) {
    client.add_event_handler(
        move |ev: ToDeviceKeyVerificationRequestEvent, client: Client| async move {
            let request = client
                .encryption()
                .get_verification_request(&ev.sender, &ev.content.transaction_id)
                .await;
            spawn_request(request, auto_confirm);
        },
    );

    client.add_event_handler(
        move |ev: OriginalSyncRoomMessageEvent, client: Client| async move {
            if matches!(ev.content.msgtype, MessageType::VerificationRequest(_)) {
                let request = client
                    .encryption()
                    .get_verification_request(&ev.sender, &ev.event_id)
                    .await;
                spawn_request(request, auto_confirm);
            }
        },
    );

    // A start without a preceding request; requested flows are driven by
    // `follow_request`.
    client.add_event_handler(
        move |ev: ToDeviceKeyVerificationStartEvent, client: Client| async move {
            let encryption = client.encryption();
            let flow = ev.content.transaction_id.as_str();
            if encryption
                .get_verification_request(&ev.sender, flow)
                .await
                .is_some()
            {
                return;
            }
            if let Some(Verification::SasV1(sas)) =
                encryption.get_verification(&ev.sender, flow).await
            {
                tokio::spawn(run_sas(sas, auto_confirm));
            }
        },
    );
}

fn spawn_request(request: Option<VerificationRequest>, auto_confirm: bool) {
    match request {
        Some(request) => {
            tokio::spawn(follow_request(request, auto_confirm));
        }
        None => warn!("Verification request not found"),
    }
}

async fn follow_request(request: VerificationRequest, auto_confirm: bool) {
    let user = request.other_user_id().to_owned();
    info!(%user, "Accepting verification request");
    if let Err(e) = request.accept().await {
        warn!(%user, error = %e, "Failed to accept verification request");
        return;
    }
    let mut changes = request.changes();
    while let Some(state) = changes.next().await {
        match state {
            VerificationRequestState::Transitioned { verification } => {
                match verification.sas() {
                    Some(sas) => run_sas(sas, auto_confirm).await,
                    None => warn!(%user, "Only emoji verification is supported"),
                }
                return;
            }
            VerificationRequestState::Cancelled(info) => {
                warn!(%user, reason = %info.reason(), "Verification request cancelled");
                return;
            }
            VerificationRequestState::Done => return,
            VerificationRequestState::Created { .. }
            | VerificationRequestState::Requested { .. }
            | VerificationRequestState::Ready { .. } => {}
        }
    }
}

async fn run_sas(sas: SasVerification, auto_confirm: bool) {
    let device = sas.other_device();
    let user = device.user_id().to_owned();
    let device_id = device.device_id().to_owned();
    if let Err(e) = sas.accept().await {
        warn!(%user, device = %device_id, error = %e, "Failed to accept SAS");
        return;
    }

    let mut changes = sas.changes();
    while let Some(state) = changes.next().await {
        match state {
            SasState::KeysExchanged {
                emojis: Some(emojis),
                ..
            } => {
                let shown = emojis
                    .emojis
                    .iter()
                    .map(|e| format!("{} ({})", e.symbol, e.description))
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(%user, device = %device_id, emojis = %shown, "SAS emojis");
                if auto_confirm {
                    if let Err(e) = sas.confirm().await {
                        warn!(%user, error = %e, "Failed to confirm SAS");
                    }
                } else {
                    info!(%user, "Auto-confirm is off; verification left unconfirmed");
                }
            }
            SasState::Done { .. } => {
                info!(%user, device = %device_id, "Device verified");
                return;
            }
            SasState::Cancelled(info) => {
                warn!(%user, reason = %info.reason(), "SAS verification cancelled");
                return;
            }
            SasState::Created { .. }
            | SasState::Started { .. }
            | SasState::Accepted { .. }
            | SasState::KeysExchanged { .. }
            | SasState::Confirmed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    fn saved() -> SavedSession {
        SavedSession {
            user_id: "@bot:example.org".try_into().unwrap(),
            device_id: "DEVICE".into(),
            access_token: "token".to_owned(),
            refresh_token: Some("refresh".to_owned()),
        }
    }

    #[test]
    fn saved_session_maps_onto_matrix_session() {
        let session = MatrixSession::from(saved());
        assert_eq!(session.meta.user_id.as_str(), "@bot:example.org");
        assert_eq!(session.meta.device_id.as_str(), "DEVICE");
        assert_eq!(session.tokens.access_token, "token");
        assert_eq!(SavedSession::from(session), saved());
    }

    #[tokio::test]
    async fn session_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/session.json");
        assert!(persist::read_json::<SavedSession>(&path).await.unwrap().is_none());

        persist::write_json_atomic(&path, &saved(), LIMIT).await.unwrap();
        let loaded = persist::read_json::<SavedSession>(&path).await.unwrap();
        assert_eq!(loaded, Some(saved()));
    }

    #[tokio::test]
    async fn session_with_bad_user_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"user_id": "bot", "device_id": "D", "access_token": "t"}"#,
        )
        .unwrap();
        assert!(persist::read_json::<SavedSession>(&path).await.is_err());
    }
}
