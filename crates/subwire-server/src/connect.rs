//! Client connector: open a [`Client`] session over `tokio-tungstenite`.

use subwire_core::{JsonMap, Role, SubProtocolKind};
use subwire_protocol::{build_adapter, offer_header};
use subwire_session::{Client, SessionConfig};
use subwire_settings::ProtocolSettings;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tracing::{debug, instrument};

use crate::errors::{ClientError, Result};
use crate::transport::tungstenite_frames;

/// Connect to `url`, offering the sub-protocols enabled in `settings`.
///
/// The adapter is chosen from the server's `Sec-WebSocket-Protocol` answer.
/// Returns once the connection is acknowledged.
#[instrument(skip(settings, init_payload))]
pub async fn connect(
    url: &str,
    settings: &ProtocolSettings,
    init_payload: Option<JsonMap>,
) -> Result<Client> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::Request(e.to_string()))?;
    let offer = HeaderValue::from_str(&offer_header(&settings.protocols))
        .map_err(|e| ClientError::Request(e.to_string()))?;
    let _ = request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, offer);

    let (socket, response) = connect_async(request).await?;
    let selected = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .ok_or(ClientError::NoSubProtocol)?
        .to_str()
        .map_err(|e| ClientError::Request(e.to_string()))?;
    let kind = accepted_kind(selected, &settings.protocols)?;
    debug!(protocol = kind.name(), "websocket connected");

    let protocol = build_adapter(kind, Role::Initiator, settings.legacy_error_policy);
    let (stream, sink) = tungstenite_frames(socket);
    let client = Client::handshake(
        stream,
        sink,
        protocol,
        SessionConfig::from_settings(settings),
        init_payload,
    )
    .await?;
    Ok(client)
}

fn accepted_kind(selected: &str, offered: &[SubProtocolKind]) -> Result<SubProtocolKind> {
    SubProtocolKind::from_name(selected)
        .filter(|kind| offered.contains(kind))
        .ok_or_else(|| ClientError::UnsupportedSubProtocol(selected.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn accepted_kind_must_have_been_offered() {
        assert_eq!(
            accepted_kind("graphql-ws", &SubProtocolKind::ALL).unwrap(),
            SubProtocolKind::Legacy
        );
        assert_matches!(
            accepted_kind("graphql-ws", &[SubProtocolKind::Current]),
            Err(ClientError::UnsupportedSubProtocol(name)) if name == "graphql-ws"
        );
        assert_matches!(
            accepted_kind("mqtt", &SubProtocolKind::ALL),
            Err(ClientError::UnsupportedSubProtocol(_))
        );
    }

    #[tokio::test]
    async fn invalid_url_is_a_request_error() {
        let result = connect("not a url", &ProtocolSettings::default(), None).await;
        assert_matches!(result, Err(ClientError::Request(_)));
    }
}
