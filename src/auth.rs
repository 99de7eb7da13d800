use anyhow::{Context, Result};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::apps::App;
use crate::protocol::SocketId;

type HmacSha256 = Hmac<Sha256>;

/// Why a private or presence subscription was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAuthError {
    Missing,
    WrongKey,
    Malformed,
    BadSignature,
}

impl ChannelAuthError {
    pub fn message(self) -> &'static str {
        match self {
            Self::Missing => "missing channel auth",
            Self::WrongKey => "channel auth was issued for another app",
            Self::Malformed => "malformed channel auth",
            Self::BadSignature => "invalid channel auth signature",
        }
    }
}

/// Signs `socket_id:channel[:channel_data]` with the app secret, returning
/// the `{key}:{hex}` string a backend hands to its client.
pub fn sign_channel_auth(
    app: &App,
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
) -> Result<String> {
    let mac = channel_mac(&app.secret, socket_id, channel, channel_data)
        .context("initialize channel auth signer")?;
    Ok(format!(
        "{}:{}",
        app.key,
        hex_encode(&mac.finalize().into_bytes())
    ))
}

pub fn verify_channel_auth(
    app: &App,
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
    provided: Option<&str>,
) -> Result<(), ChannelAuthError> {
    let provided = provided
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ChannelAuthError::Missing)?;
    let (key, signature) = provided
        .split_once(':')
        .ok_or(ChannelAuthError::Malformed)?;
    if key != app.key {
        return Err(ChannelAuthError::WrongKey);
    }
    let signature = hex_decode(signature).ok_or(ChannelAuthError::Malformed)?;
    channel_mac(&app.secret, socket_id, channel, channel_data)
        .map_err(|_| ChannelAuthError::BadSignature)?
        .verify_slice(&signature)
        .map_err(|_| ChannelAuthError::BadSignature)
}

fn channel_mac(
    secret: &str,
    socket_id: &SocketId,
    channel: &str,
    channel_data: Option<&str>,
) -> std::result::Result<HmacSha256, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(socket_id.as_str().as_bytes());
    mac.update(b":");
    mac.update(channel.as_bytes());
    if let Some(data) = channel_data {
        mac.update(b":");
        mac.update(data.as_bytes());
    }
    Ok(mac)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 || !value.is_ascii() {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(&value[idx..idx + 2], 16).ok())
        .collect()
}
