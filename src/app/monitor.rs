use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::packet::{parse_rxpk_line, LoRaWanFrame, MonitorStats, RxPacket};
use crate::domain::DomainError;

/// Which packets get printed.
#[derive(Debug, Clone, Default)]
pub struct MonitorFilter {
    /// Only report frames from this device address.
    pub dev_addr: Option<u32>,
    /// Also print packets that do not match `dev_addr`.
    pub show_all: bool,
}

impl MonitorFilter {
    /// Parse a DevAddr given as 8 hex digits, with or without `0x`.
    pub fn parse_dev_addr(raw: &str) -> Result<u32, DomainError> {
        let digits = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
        if digits.len() != 8 {
            return Err(DomainError::ConfigurationInvalid(format!(
                "DevAddr '{}' must be 8 hex digits",
                raw
            )));
        }
        u32::from_str_radix(digits, 16).map_err(|_| {
            DomainError::ConfigurationInvalid(format!("DevAddr '{}' is not hexadecimal", raw))
        })
    }

    fn matches(&self, frame: Option<&LoRaWanFrame>) -> bool {
        match self.dev_addr {
            None => true,
            Some(addr) => frame.map(|f| f.dev_addr == addr).unwrap_or(false),
        }
    }
}

/// One received packet after decoding.
#[derive(Debug, Clone)]
pub struct PacketReport {
    pub packet: RxPacket,
    pub frame: Option<LoRaWanFrame>,
    pub matched: bool,
}

impl PacketReport {
    pub fn render(&self) -> String {
        let quality = self.packet.quality();
        let mut out = format!(
            "{} {:.1} MHz {} RSSI {} dBm ({}) SNR {:.1} dB ({}) ~{}",
            self.packet.time.as_deref().unwrap_or("-"),
            self.packet.freq,
            self.packet.datr,
            self.packet.rssi,
            quality.signal,
            self.packet.lsnr,
            quality.snr,
            quality.distance,
        );
        match &self.frame {
            Some(frame) => {
                out.push_str(&format!(
                    "\n  {:?} DevAddr {} FCnt {}",
                    frame.mtype,
                    frame.dev_addr_hex(),
                    frame.fcnt
                ));
                if let Some(port) = frame.fport {
                    out.push_str(&format!(" FPort {}", port));
                }
                out.push_str(&format!(" payload {} bytes", frame.frm_payload.len()));
            }
            None => out.push_str(&format!("\n  undecodable ({} bytes)", self.packet.size)),
        }
        out
    }
}

/// Accumulates statistics over forwarder output lines.
#[derive(Debug, Default)]
pub struct PacketMonitor {
    filter: MonitorFilter,
    stats: MonitorStats,
}

impl PacketMonitor {
    pub fn new(filter: MonitorFilter) -> Self {
        Self {
            filter,
            stats: MonitorStats::default(),
        }
    }

    /// Decode every packet in `line`; returns the ones that should be printed.
    pub fn process_line(&mut self, line: &str) -> Vec<PacketReport> {
        let mut reports = Vec::new();
        for packet in parse_rxpk_line(line) {
            let frame = packet
                .payload()
                .and_then(|bytes| LoRaWanFrame::parse(&bytes))
                .map_err(|e| debug!(error = %e, "Frame not decodable"))
                .ok();
            let matched = self.filter.matches(frame.as_ref());
            self.stats.record(frame.as_ref(), matched);
            if matched || self.filter.show_all {
                reports.push(PacketReport {
                    packet,
                    frame,
                    matched,
                });
            }
        }
        reports
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "packets: {}  matched: {} ({:.1}%)  undecodable: {}",
            self.stats.total,
            self.stats.matched,
            self.stats.match_percentage(),
            self.stats.undecodable
        );
        for (addr, count) in &self.stats.per_device {
            out.push_str(&format!("\n  {}: {}", addr, count));
        }
        out
    }
}

/// Read forwarder output until EOF or cancellation, printing reports to `out`.
///
/// With `echo` every raw line is written through as well.
pub async fn run_monitor<R, W>(
    reader: R,
    out: &mut W,
    monitor: &mut PacketMonitor,
    echo: bool,
    cancel: CancellationToken,
) -> Result<(), DomainError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        if echo {
            writeln!(out, "{}", line)?;
        }
        for report in monitor.process_line(&line) {
            writeln!(out, "{}", report.render())?;
        }
    }
    info!(total = monitor.stats().total, matched = monitor.stats().matched, "Monitoring finished");
    Ok(())
}
