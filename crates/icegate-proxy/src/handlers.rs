// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Icecast admin endpoints kept for encoder compatibility
//!
//! Both answer with fixed XML bodies whatever happens, because encoders only
//! check for a 200.

use crate::identifier::Identifier;
use crate::metadata::{to_utf8, Metadata, DEFAULT_CHARSET};
use crate::server::{AppState, PeerAddr};
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension,
};
use chrono::Utc;
use icegate_domain_types::User;
use percent_encoding::percent_decode;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const METADATA_ACK: &str = "<?xml version=\"1.0\"?>\n<iceresponse><message>Metadata update successful</message><return>1</return></iceresponse>\n";

/// Query parameters decoded to raw bytes; the charset is applied later
pub fn parse_query(raw: &str) -> HashMap<String, Vec<u8>> {
    let decode = |s: &str| -> Vec<u8> {
        let spaced = s.replace('+', " ");
        percent_decode(spaced.as_bytes()).collect()
    };

    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (String::from_utf8_lossy(&decode(key)).into_owned(), decode(value))
        })
        .collect()
}

/// The `mount` parameter, lowercased
fn mount_param(query: &HashMap<String, Vec<u8>>) -> String {
    query
        .get("mount")
        .map(|m| String::from_utf8_lossy(m).to_lowercase())
        .unwrap_or_default()
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn xml(body: String) -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], body)
}

/// `GET /admin/metadata?mount=&song=&charset=`
pub async fn update_metadata(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Extension(PeerAddr(peer)): Extension<PeerAddr>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query = parse_query(query.as_deref().unwrap_or_default());
    let mount = mount_param(&query);
    let song = query.get("song").cloned().unwrap_or_default();

    if mount.is_empty() || song.is_empty() {
        debug!(username = %user.username, %mount, "ignoring metadata update without mount or song");
        return xml(METADATA_ACK.to_string());
    }

    let charset = query
        .get("charset")
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string());

    let value = match to_utf8(&charset, &song) {
        Ok(value) if !value.is_empty() => value,
        Ok(_) => return xml(METADATA_ACK.to_string()),
        Err(e) => {
            warn!(username = %user.username, %mount, %charset, error = %e, "dropping undecodable metadata");
            return xml(METADATA_ACK.to_string());
        }
    };

    let metadata = Metadata {
        identifier: Identifier::for_peer(&user.username, &mount, peer),
        mount,
        value,
        username: user.username,
        address: peer.to_string(),
        time: Utc::now(),
    };
    info!(
        mount = %metadata.mount,
        username = %metadata.username,
        identifier = %metadata.identifier,
        metadata = %metadata.value,
        "received metadata"
    );

    if let Err(e) = state.manager.send_metadata(metadata, &state.shutdown).await {
        warn!(error = %e, "metadata update not delivered");
    }
    xml(METADATA_ACK.to_string())
}

/// `GET /admin/listclients?mount=`; listeners are not tracked here
pub async fn list_clients(RawQuery(query): RawQuery) -> impl IntoResponse {
    let query = parse_query(query.as_deref().unwrap_or_default());
    let mount = mount_param(&query);
    xml(format!(
        "<?xml version=\"1.0\"?>\n<icestats><source mount=\"{}\"><Listeners>0</Listeners></source></icestats>\n",
        xml_escape(&mount)
    ))
}

/// Anything else an authorized DJ sends that is not a source request
pub async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_stay_raw_bytes() {
        let query = parse_query("mount=%2FMain.mp3&song=caf%E9+au+lait&charset=latin1&flag");
        assert_eq!(query["mount"], b"/Main.mp3");
        assert_eq!(query["song"], b"caf\xe9 au lait");
        assert_eq!(query["charset"], b"latin1");
        assert_eq!(query["flag"], b"");
        assert_eq!(mount_param(&query), "/main.mp3");
    }

    #[test]
    fn escapes_mount_for_xml() {
        assert_eq!(xml_escape(r#"/a&b<"c">"#), "/a&amp;b&lt;&quot;c&quot;&gt;");
    }
}
