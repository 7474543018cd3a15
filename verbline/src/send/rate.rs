//! Hardware packet pacing.
//!
//! The configured rate is in bytes per second of UDP payload. The device
//! paces Ethernet frames in kbit/s, so the rate is scaled by the framing
//! overhead of a full-sized packet. Any obstacle falls back to software
//! rate limiting; none of them is an error.

use crate::frame::HEADER_LEN;
use crate::observer::Observer;
use crate::resource::{CmId, QueuePair};
use crate::verbs::{PacketPacingCaps, Provider, RateLimit};

/// Pacing parameters for `rate` bytes/s of payload, or the reason the
/// device cannot apply them.
pub(crate) fn hw_rate_limit(
    caps: Option<PacketPacingCaps>,
    rate: f64,
    max_packet_size: usize,
) -> Result<RateLimit, &'static str> {
    let caps = caps.unwrap_or_default();
    if !caps.raw_packet_qp || caps.qp_rate_limit_max == 0 {
        return Err("it is not supported by the device");
    }
    let frame_size = max_packet_size + HEADER_LEN;
    let overhead = frame_size as f64 / max_packet_size as f64;
    let rate_kbps = rate * 8e-3 * overhead;
    if rate_kbps < f64::from(caps.qp_rate_limit_min) || rate_kbps > f64::from(caps.qp_rate_limit_max)
    {
        return Err("the HW does not support the rate");
    }
    Ok(RateLimit {
        rate_limit: rate_kbps as u32,
        typical_pkt_sz: frame_size.min(u16::MAX as usize) as u16,
        // A one-packet burst keeps pacing tight; smaller values are ignored
        // by the device.
        max_burst_sz: frame_size as u32,
    })
}

/// Try to offload rate limiting to `qp`. Returns whether it took effect.
pub(crate) fn setup_hw_rate<P: Provider>(
    id: &CmId<P>,
    qp: &QueuePair<P>,
    rate: f64,
    max_packet_size: usize,
    observer: &dyn Observer,
) -> bool {
    let attr = match id.query_device() {
        Ok(attr) => attr,
        Err(_) => {
            observer.debug(format_args!(
                "Not using HW rate limiting because ibv_query_device_ex failed"
            ));
            return false;
        }
    };
    let limit = match hw_rate_limit(attr.packet_pacing, rate, max_packet_size) {
        Ok(limit) => limit,
        Err(reason) => {
            observer.debug(format_args!("Not using HW rate limiting because {reason}"));
            return false;
        }
    };
    if qp.set_rate_limit(&limit).is_err() {
        observer.debug(format_args!(
            "Not using HW rate limiting because ibv_modify_qp_rate_limit failed"
        ));
        return false;
    }
    true
}
