pub mod capture;
pub mod codec;
pub mod config;
pub mod interfaces;
pub mod observer;
pub mod statistics;

use std::sync::Arc;

use crate::{
    capture::CaptureReport,
    config::{Config, Mode},
    statistics::{Number, Statistics},
};

/// Entry point behind `main`, split out so an embedding or an integration
/// test can start the monitor without going through the process boundary.
pub async fn capture_main(config: Arc<Config>) -> anyhow::Result<()> {
    if let Mode::ListInterfaces = config.mode {
        return interfaces::list_interfaces();
    }

    if !config.silent {
        println!(
            "Call monitor starting: interface={}, output={}",
            config.interface,
            config.output.display()
        );
        if config.time > 0 {
            println!("Capture stops after {} seconds", config.time);
        }
        if config.auto {
            println!("Auto mode: capture stops when the call ends");
        }
        println!("Press Ctrl+C to stop");
    }

    let statistics = Statistics::default();
    let report = capture::run(config.clone(), statistics.clone()).await?;

    if !config.silent {
        print_summary(&statistics, &report);
    }

    Ok(())
}

fn print_summary(statistics: &Statistics, report: &CaptureReport) {
    let counts = statistics.counts();

    println!("\nCapture summary");
    println!("  dialog:        {}", report.dialog_state);
    if let Some(call_id) = &report.call_id {
        println!("  call-id:       {}", call_id);
    }
    println!("  packets:       {}", counts.total_pkts.get());
    println!("  sip packets:   {}", report.sip_packets);
    println!("  rtp packets:   {}", report.media_packets);
    println!("  bytes written: {}", counts.written_bytes.get());

    for stream in statistics.stream_snapshot() {
        println!(
            "  stream ssrc={:#010x} pt={} {}: received={}, lost={}, ooo={}, \
             jitter={:.1}ms, concealed={}ms, recovered={}",
            stream.ssrc,
            stream.payload_type,
            stream.direction,
            stream.packets_received,
            stream.lost,
            stream.out_of_order,
            stream.jitter_ms,
            stream.concealed_ms,
            stream.recovered,
        );
    }
}
