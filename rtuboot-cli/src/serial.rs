//! Serial port selection and the transport behind each operation.

use {
    crate::{CliError, Settings, TransportKind},
    anyhow::{Context, Result},
    log::{debug, info},
    rtuboot::{
        ListenerSession, NativePort, NativePortEnumerator, PortEnumerator, SerialConfig, Session,
        Transport, protocol::Command,
    },
    std::time::Duration,
};

fn usage_err(message: &str) -> anyhow::Error {
    // Missing ports are a setup problem, exit code 2
    CliError::Usage(message.to_string()).into()
}

/// Pick the port to open: explicit (flag, env or config) or the first one
/// in name order.
pub(crate) fn resolve_port(explicit: Option<&str>) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }

    let first = NativePortEnumerator::first_port().context("failed to enumerate serial ports")?;
    match first {
        Some(port) => {
            info!("No port given, using {}", port.name);
            Ok(port.name)
        },
        None => Err(usage_err("no serial ports found")),
    }
}

/// Either transport, chosen at runtime.
pub(crate) enum Link {
    Blocking(Session<NativePort>),
    Listener(ListenerSession<NativePort>),
}

impl Transport for Link {
    fn address(&self) -> u8 {
        match self {
            Self::Blocking(s) => s.address(),
            Self::Listener(s) => s.address(),
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            Self::Blocking(s) => s.timeout(),
            Self::Listener(s) => s.timeout(),
        }
    }

    fn execute_with_timeout<C: Command>(
        &mut self,
        request: &C,
        timeout: Duration,
    ) -> rtuboot::Result<C::Response> {
        match self {
            Self::Blocking(s) => s.execute_with_timeout(request, timeout),
            Self::Listener(s) => s.execute_with_timeout(request, timeout),
        }
    }

    fn close(&mut self) -> rtuboot::Result<()> {
        match self {
            Self::Blocking(s) => s.close(),
            Self::Listener(s) => s.close(),
        }
    }
}

/// Open the serial port and wrap it in the configured transport.
pub(crate) fn open_link(settings: &Settings) -> Result<Link> {
    let name = resolve_port(settings.port.as_deref())?;
    let boot = &settings.boot;

    let serial = SerialConfig::new(&name, boot.baud_rate).with_parity(settings.parity);
    let port = NativePort::open(&serial)
        .with_context(|| format!("failed to open serial port {name}"))?;
    debug!(
        "Opened {name} at {} baud, slave {}, {:?} transport",
        boot.baud_rate, boot.address, settings.transport
    );

    let link = match settings.transport {
        TransportKind::Blocking => Link::Blocking(Session::from_config(port, boot)?),
        TransportKind::Listener => {
            let reader = port
                .try_clone()
                .with_context(|| format!("failed to clone handle for {name}"))?;
            let session =
                ListenerSession::spawn(reader, port, boot.address)?.with_timeout(boot.timeout);
            Link::Listener(session)
        },
    };
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_port_wins() {
        assert_eq!(resolve_port(Some("COM9")).unwrap(), "COM9");
    }

    #[test]
    fn test_missing_port_is_usage_error() {
        // Only meaningful on machines without serial ports
        if let Ok(None) = NativePortEnumerator::first_port() {
            let err = resolve_port(None).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CliError>(),
                Some(CliError::Usage(_))
            ));
        }
    }
}
