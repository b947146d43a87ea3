use std::fmt;

use nix::unistd::Pid;

use crate::{
    error::WireError,
    event::{CredentialEvent, CredentialKind, IdPair},
    wire::{
        CN_MSG_LEN, CnMsgHeader, IdEventRecord, NLMSG_DONE, NLMSG_ERROR, NLMSG_HDRLEN,
        NLMSG_NOOP, NLMSG_OVERRUN, NlMsgHeader, PROC_EVENT_GID, PROC_EVENT_HEADER_LEN,
        PROC_EVENT_UID, ProcEventHeader, nlmsg_align,
    },
};

/// Kernel marker that cut a batch short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Error,
    Overrun,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Error => f.write_str("error"),
            Interruption::Overrun => f.write_str("overrun"),
        }
    }
}

/// Counters collected while walking a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Well formed frames seen, including skipped ones.
    pub frames: u64,
    pub noops: u64,
    pub credential_events: u64,
    /// Process events of other kinds and non process connector messages.
    pub ignored: u64,
    /// Frames or payloads too short for what they declare.
    pub truncated: u64,
}

impl DecodeStats {
    pub fn merge(&mut self, other: &DecodeStats) {
        self.frames += other.frames;
        self.noops += other.noops;
        self.credential_events += other.credential_events;
        self.ignored += other.ignored;
        self.truncated += other.truncated;
    }
}

/// Walks the frames of one received batch.
///
/// Yields credential events in the order the kernel emitted them. Once the
/// iterator returns `None` the batch is exhausted: either all bytes were
/// consumed, a `NLMSG_DONE` frame was handled, a malformed frame was found,
/// or the kernel signalled an error/overrun (see [`BatchDecoder::interruption`]).
pub struct BatchDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
    interruption: Option<Interruption>,
    stats: DecodeStats,
}

/// Starts decoding `batch`.
pub fn decode(batch: &[u8]) -> BatchDecoder<'_> {
    BatchDecoder {
        buf: batch,
        offset: 0,
        finished: false,
        interruption: None,
        stats: DecodeStats::default(),
    }
}

impl BatchDecoder<'_> {
    /// The kernel marker that stopped this batch, if any.
    pub fn interruption(&self) -> Option<Interruption> {
        self.interruption
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    fn stop(&mut self) {
        self.finished = true;
    }

    fn truncated(&mut self, err: WireError) {
        log::debug!("Dropping rest of batch at offset {}: {err}", self.offset);
        self.stats.truncated += 1;
        self.stop();
    }
}

impl Iterator for BatchDecoder<'_> {
    type Item = CredentialEvent;

    fn next(&mut self) -> Option<CredentialEvent> {
        loop {
            if self.finished {
                return None;
            }

            let remaining = &self.buf[self.offset..];
            if remaining.is_empty() {
                self.stop();
                return None;
            }

            let header = match NlMsgHeader::parse(remaining) {
                Ok(header) => header,
                Err(err) => {
                    self.truncated(err);
                    return None;
                }
            };

            let frame_len = header.len as usize;
            if frame_len < NLMSG_HDRLEN || frame_len > remaining.len() {
                self.truncated(WireError::BadLength {
                    record: "nlmsghdr",
                    declared: frame_len,
                });
                return None;
            }

            let payload = &remaining[NLMSG_HDRLEN..frame_len];
            self.offset = (self.offset + nlmsg_align(frame_len)).min(self.buf.len());
            self.stats.frames += 1;

            match header.kind {
                NLMSG_NOOP => {
                    self.stats.noops += 1;
                    continue;
                }
                NLMSG_ERROR => {
                    self.interruption = Some(Interruption::Error);
                    self.stop();
                    return None;
                }
                NLMSG_OVERRUN => {
                    self.interruption = Some(Interruption::Overrun);
                    self.stop();
                    return None;
                }
                NLMSG_DONE => self.stop(),
                _ => {}
            }

            match decode_payload(payload) {
                Ok(Some(event)) => {
                    self.stats.credential_events += 1;
                    return Some(event);
                }
                Ok(None) => self.stats.ignored += 1,
                Err(err) => {
                    self.truncated(err);
                    return None;
                }
            }
        }
    }
}

/// Interprets the connector payload of a single frame.
///
/// Returns `Ok(None)` for anything that is not a uid/gid change.
fn decode_payload(payload: &[u8]) -> Result<Option<CredentialEvent>, WireError> {
    let cn = CnMsgHeader::parse(payload)?;
    if !cn.is_proc() {
        return Ok(None);
    }

    let data = &payload[CN_MSG_LEN..];
    let data_len = cn.len as usize;
    if data_len > data.len() {
        return Err(WireError::Truncated {
            record: "cn_msg data",
            needed: data_len,
            available: data.len(),
        });
    }
    let data = &data[..data_len];

    let header = ProcEventHeader::parse(data)?;
    let kind = match header.what {
        PROC_EVENT_UID => CredentialKind::UidChanged,
        PROC_EVENT_GID => CredentialKind::GidChanged,
        _ => return Ok(None),
    };

    let record = IdEventRecord::parse(&data[PROC_EVENT_HEADER_LEN..])?;
    Ok(Some(CredentialEvent {
        pid: Pid::from_raw(record.pid),
        tgid: Pid::from_raw(record.tgid),
        kind,
        primary: IdPair {
            real: record.real,
            effective: record.effective,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        NLMSG_MIN_TYPE, PROC_EVENT_NONE,
        testing::{control_frame, gid_frame, id_event_frame, uid_frame},
    };

    fn data_uid_frame(pid: i32, euid: u32) -> Vec<u8> {
        id_event_frame(NLMSG_MIN_TYPE, PROC_EVENT_UID, pid, pid, 0, euid)
    }

    #[test]
    fn uid_event() {
        let batch = uid_frame(100, 0, 1000);
        let events: Vec<_> = decode(&batch).collect();
        assert_eq!(
            events,
            vec![CredentialEvent {
                pid: Pid::from_raw(100),
                tgid: Pid::from_raw(100),
                kind: CredentialKind::UidChanged,
                primary: IdPair {
                    real: 0,
                    effective: 1000
                },
            }]
        );
    }

    #[test]
    fn gid_event() {
        let batch = gid_frame(7, 10, 20);
        let event = decode(&batch).next().unwrap();
        assert_eq!(event.kind, CredentialKind::GidChanged);
        assert_eq!(event.primary.effective, 20);
    }

    #[test]
    fn error_marker_stops_batch() {
        let mut batch = control_frame(NLMSG_NOOP);
        batch.extend(data_uid_frame(5, 1000));
        batch.extend(control_frame(NLMSG_ERROR));
        batch.extend(data_uid_frame(6, 1000));

        let mut decoder = decode(&batch);
        let pids: Vec<_> = decoder.by_ref().map(|e| e.pid.as_raw()).collect();
        assert_eq!(pids, vec![5]);
        assert_eq!(decoder.interruption(), Some(Interruption::Error));
        assert_eq!(decoder.stats().noops, 1);
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn overrun_marker_stops_batch() {
        let mut batch = control_frame(NLMSG_OVERRUN);
        batch.extend(data_uid_frame(6, 1000));

        let mut decoder = decode(&batch);
        assert_eq!(decoder.next(), None);
        assert_eq!(decoder.interruption(), Some(Interruption::Overrun));
    }

    #[test]
    fn done_frame_ends_batch() {
        let mut batch = uid_frame(1, 0, 1);
        batch.extend(uid_frame(2, 0, 2));

        let mut decoder = decode(&batch);
        assert_eq!(decoder.by_ref().count(), 1);
        assert_eq!(decoder.interruption(), None);
    }

    #[test]
    fn other_kinds_are_counted_and_skipped() {
        let mut batch = id_event_frame(NLMSG_MIN_TYPE, PROC_EVENT_NONE, 1, 1, 0, 0);
        batch.extend(id_event_frame(NLMSG_MIN_TYPE, 0x1, 2, 2, 0, 0));
        batch.extend(data_uid_frame(3, 33));

        let mut decoder = decode(&batch);
        let pids: Vec<_> = decoder.by_ref().map(|e| e.pid.as_raw()).collect();
        assert_eq!(pids, vec![3]);
        assert_eq!(decoder.stats().ignored, 2);
        assert_eq!(decoder.stats().credential_events, 1);
    }

    #[test]
    fn truncated_trailing_fragment_is_dropped() {
        let mut batch = data_uid_frame(5, 1000);
        let next = data_uid_frame(6, 1000);
        batch.extend_from_slice(&next[..30]);

        let mut decoder = decode(&batch);
        let pids: Vec<_> = decoder.by_ref().map(|e| e.pid.as_raw()).collect();
        assert_eq!(pids, vec![5]);
        assert_eq!(decoder.stats().truncated, 1);
        assert_eq!(decoder.interruption(), None);
    }

    #[test]
    fn short_payload_is_dropped() {
        let mut frame = data_uid_frame(5, 1000);
        // Shrink the declared frame length so the id record is cut off.
        let short = (NLMSG_HDRLEN + CN_MSG_LEN + PROC_EVENT_HEADER_LEN + 4) as u32;
        frame[..4].copy_from_slice(&short.to_ne_bytes());

        let mut decoder = decode(&frame);
        assert_eq!(decoder.next(), None);
        assert_eq!(decoder.stats().truncated, 1);
    }

    #[test]
    fn bogus_length_is_dropped() {
        let mut frame = control_frame(NLMSG_MIN_TYPE);
        frame[..4].copy_from_slice(&4u32.to_ne_bytes());

        let mut decoder = decode(&frame);
        assert_eq!(decoder.next(), None);
        assert_eq!(decoder.stats().truncated, 1);
    }

    #[test]
    fn empty_batch() {
        assert_eq!(decode(&[]).next(), None);
    }
}
