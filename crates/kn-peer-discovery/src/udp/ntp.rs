//! SNTP clock drift check.
//!
//! Discovery packets carry absolute expirations, so a local clock that is
//! off by more than the expiry window makes every peer drop our packets.
//! When requests keep timing out, the pending loop asks an NTP pool for the
//! time and warns if we are too far off.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::domain::DRIFT_THRESHOLD;

/// NTP pool queried for the reference time.
pub const NTP_POOL: &str = "pool.ntp.org:123";
/// Measurements averaged per check.
pub const NTP_CHECKS: usize = 3;

const NTP_PACKET_SIZE: usize = 48;
const NTP_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Seconds between the NTP era (1900) and the unix epoch.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Query the pool and warn about a drifting clock.
pub(crate) async fn check_clock_drift() {
    match sntp_drift(NTP_CHECKS).await {
        Ok(drift) if drift.unsigned_abs() > DRIFT_THRESHOLD.as_nanos() => {
            warn!(
                drift_ms = (drift / 1_000_000) as i64,
                "System clock seems off, network connectivity may be affected. \
                 Please enable network time synchronisation in system settings"
            );
        }
        Ok(drift) => debug!(drift_ms = (drift / 1_000_000) as i64, "NTP sanity check done"),
        Err(e) => debug!(error = %e, "Failed to query NTP server"),
    }
}

/// Measure the local clock offset against [`NTP_POOL`], in nanoseconds.
///
/// Positive values mean the local clock is ahead. `measurements + 2` samples
/// are taken and the extremes discarded before averaging.
pub async fn sntp_drift(measurements: usize) -> std::io::Result<i128> {
    let mut request = [0u8; NTP_PACKET_SIZE];
    // LI = 0, VN = 3, Mode = 3 (client).
    request[0] = 3 << 3 | 3;

    let mut drifts = Vec::with_capacity(measurements + 2);
    for _ in 0..measurements + 2 {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(NTP_POOL).await?;

        let sent_wall = SystemTime::now();
        let sent = Instant::now();
        socket.send(&request).await?;

        let mut reply = [0u8; NTP_PACKET_SIZE];
        let n = time::timeout(NTP_READ_TIMEOUT, socket.recv(&mut reply))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "NTP read timeout"))??;
        let elapsed = sent.elapsed();

        let server = parse_transmit_time(&reply[..n]).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "short NTP reply")
        })?;
        drifts.push(clock_offset(sent_wall, server, elapsed));
    }
    Ok(trimmed_mean(drifts, measurements))
}

/// Transmit timestamp of an NTP reply as nanoseconds since the unix epoch.
pub(crate) fn parse_transmit_time(reply: &[u8]) -> Option<i128> {
    if reply.len() < NTP_PACKET_SIZE {
        return None;
    }
    let sec = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    let frac = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]) as u64;
    let nanos = (frac * 1_000_000_000) >> 32;
    Some((sec as i128 - NTP_EPOCH_OFFSET as i128) * 1_000_000_000 + nanos as i128)
}

/// Offset of the local clock, assuming a symmetric round trip.
fn clock_offset(sent: SystemTime, server_nanos: i128, round_trip: Duration) -> i128 {
    let local = match sent.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    };
    local - server_nanos + round_trip.as_nanos() as i128 / 2
}

/// Sort, drop the lowest and highest sample and average the rest over
/// `measurements`.
pub(crate) fn trimmed_mean(mut drifts: Vec<i128>, measurements: usize) -> i128 {
    if drifts.len() < 3 || measurements == 0 {
        return 0;
    }
    drifts.sort_unstable();
    let sum: i128 = drifts[1..drifts.len() - 1].iter().sum();
    sum / measurements as i128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transmit_time() {
        let mut reply = [0u8; NTP_PACKET_SIZE];
        // 1970-01-01T00:00:01.5Z
        reply[40..44].copy_from_slice(&((NTP_EPOCH_OFFSET + 1) as u32).to_be_bytes());
        reply[44..48].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        assert_eq!(parse_transmit_time(&reply), Some(1_500_000_000));
        assert_eq!(parse_transmit_time(&reply[..40]), None);
    }

    #[test]
    fn test_trimmed_mean_drops_extremes() {
        let drifts = vec![1_000, -50_000, 3_000, 2_000, 90_000];
        assert_eq!(trimmed_mean(drifts, 3), 2_000);
        assert_eq!(trimmed_mean(vec![5], 1), 0);
    }

    #[test]
    fn test_clock_offset_accounts_for_round_trip() {
        let sent = UNIX_EPOCH + Duration::from_secs(10);
        let server = 9_000_000_000;
        let offset = clock_offset(sent, server, Duration::from_millis(200));
        assert_eq!(offset, 1_100_000_000);
    }
}
