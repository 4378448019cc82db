use anyhow::Result;
use pcap::Device;

/// Prints the interface table for `--list`.
pub fn list_interfaces() -> Result<()> {
    let devices = Device::list()?;

    println!("\nAvailable Network Interfaces:");
    println!("{:<16} {:<12} {:<40} {}", "Interface", "Type", "Address", "Status");
    println!("{:<16} {:<12} {:<40} {}", "---------", "----", "-------", "------");

    for device in devices {
        let kind = if device.flags.is_loopback() {
            "Loopback"
        } else {
            "Ethernet"
        };
        let status = if device.flags.is_up() { "UP" } else { "DOWN" };

        let address = device
            .addresses
            .first()
            .map(|a| a.addr.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!("{:<16} {:<12} {:<40} {}", device.name, kind, address, status);
    }

    println!();
    Ok(())
}
