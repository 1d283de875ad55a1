//! Serial port listing.

use anyhow::{Context, Result};
use console::style;
use rtuboot::{NativePortEnumerator, PortEnumerator, PortInfo};

/// `name: description [hwid]`
fn format_port(port: &PortInfo) -> String {
    format!("{}: {} [{}]", port.name, port.description(), port.hwid())
}

fn ports_json(ports: &[PortInfo]) -> serde_json::Value {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "description": p.description(),
                "hwid": p.hwid(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial_number,
            })
        })
        .collect()
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("failed to enumerate serial ports")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&ports)).context("failed to encode JSON")?
        );
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{}", style("no serial ports found").dim());
    }
    for port in &ports {
        println!("{}", format_port(port));
    }
    Ok(())
}
