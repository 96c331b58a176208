use tsunagi::TransportError;

/// Classifies a `lapin` failure so the bus can tell a lost connection from a refused operation.
pub fn map_lapin_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(err) => TransportError::Connectivity(err.to_string()),
        lapin::Error::InvalidConnectionState(state) => {
            TransportError::Connectivity(format!("connection is {state:?}"))
        }
        lapin::Error::MissingHeartbeatError => TransportError::Connectivity("missed broker heartbeat".to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => TransportError::ChannelClosed,
        lapin::Error::ProtocolError(err) => TransportError::Protocol(err.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{ChannelState, ConnectionState};
    use std::{io, sync::Arc};

    #[test]
    fn test_io_errors_are_connectivity() {
        let err = lapin::Error::IOError(Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        assert!(map_lapin_error(err).is_connectivity());

        let err = lapin::Error::InvalidConnectionState(ConnectionState::Closed);
        assert!(map_lapin_error(err).is_connectivity());
    }

    #[test]
    fn test_closed_channel_is_reported_as_such() {
        let err = lapin::Error::InvalidChannelState(ChannelState::Closed);
        assert_eq!(map_lapin_error(err), TransportError::ChannelClosed);
    }

    #[test]
    fn test_other_errors_are_protocol_errors() {
        assert!(matches!(
            map_lapin_error(lapin::Error::ChannelsLimitReached),
            TransportError::Protocol(_)
        ));
    }
}
