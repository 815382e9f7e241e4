//! Sub-protocol negotiation over `Sec-WebSocket-Protocol`.

use subwire_core::SubProtocolKind;
use tracing::debug;

/// Pick the sub-protocol for a connection.
///
/// `offered` holds the raw header values sent by the initiator (each may be
/// a comma-separated list). `preferred` is the local preference order; the
/// first preferred protocol the peer also offered wins.
pub fn negotiate<'a, I>(offered: I, preferred: &[SubProtocolKind]) -> Option<SubProtocolKind>
where
    I: IntoIterator<Item = &'a str>,
{
    let offered: Vec<SubProtocolKind> = offered
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(SubProtocolKind::from_name)
        .collect();
    let selected = preferred
        .iter()
        .copied()
        .find(|kind| offered.contains(kind));
    debug!(?offered, ?selected, "negotiated sub-protocol");
    selected
}

/// Header value offering `kinds` in order.
pub fn offer_header(kinds: &[SubProtocolKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFERRED: [SubProtocolKind; 2] = SubProtocolKind::ALL;

    #[test]
    fn single_offer() {
        assert_eq!(
            negotiate(["graphql-ws"], &PREFERRED),
            Some(SubProtocolKind::Legacy)
        );
    }

    #[test]
    fn local_preference_wins_over_offer_order() {
        assert_eq!(
            negotiate(["graphql-ws, graphql-transport-ws"], &PREFERRED),
            Some(SubProtocolKind::Current)
        );
    }

    #[test]
    fn multiple_header_values() {
        assert_eq!(
            negotiate(["foo", "graphql-transport-ws"], &PREFERRED),
            Some(SubProtocolKind::Current)
        );
    }

    #[test]
    fn no_overlap() {
        assert_eq!(negotiate(["mqtt", "wamp"], &PREFERRED), None);
        assert_eq!(negotiate([], &PREFERRED), None);
    }

    #[test]
    fn restricted_preference() {
        assert_eq!(
            negotiate(["graphql-transport-ws"], &[SubProtocolKind::Legacy]),
            None
        );
    }

    #[test]
    fn offer_header_lists_names() {
        assert_eq!(offer_header(&PREFERRED), "graphql-transport-ws, graphql-ws");
        assert_eq!(offer_header(&[]), "");
    }
}
