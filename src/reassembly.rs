//! Reassembly of messages the peer splits over several notifications.
//!
//! A fragmented notification starts with a four byte header:
//!
//! ```text
//! ['#']['#'][total: u8][sequence: u8][payload ...]
//! ```
//!
//! Sequence numbers count from 1 up to `total`. Notifications without the
//! marker are complete messages on their own.

use log::{debug, error};

use crate::error::{Result, SppError};

pub const FRAGMENT_MARKER: [u8; 2] = *b"##";
pub const HEADER_LEN: usize = 4;

/// Largest payload a single fragment carries for a given transfer unit.
pub fn fragment_capacity(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub total: u8,
    pub sequence: u8,
}

impl FragmentHeader {
    /// Parse the header of a notification value.
    ///
    /// Returns `None` when the value does not carry the fragment marker.
    pub fn parse(value: &[u8]) -> Option<Result<(FragmentHeader, &[u8])>> {
        if !value.starts_with(&FRAGMENT_MARKER) {
            return None;
        }
        if value.len() < HEADER_LEN || value[2] == 0 {
            return Some(Err(SppError::MalformedFragment { len: value.len() }));
        }
        let header = FragmentHeader {
            total: value[2],
            sequence: value[3],
        };
        Some(Ok((header, &value[HEADER_LEN..])))
    }
}

#[derive(Debug)]
struct ReassemblyBuffer {
    total: u8,
    next: u8,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Option<ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notification value.
    ///
    /// Returns the completed message once the last fragment arrived, or the
    /// value itself if it was not fragmented. Any error discards the message
    /// in flight.
    pub fn push(&mut self, value: &[u8], mtu: u16) -> Result<Option<Vec<u8>>> {
        let (header, payload) = match FragmentHeader::parse(value) {
            None => return Ok(Some(value.to_vec())),
            Some(Ok(x)) => x,
            Some(Err(e)) => {
                self.reset();
                return Err(e);
            }
        };

        let expected = self.buffer.as_ref().map(|b| b.next).unwrap_or(1);
        let total_changed = self
            .buffer
            .as_ref()
            .map(|b| b.total != header.total)
            .unwrap_or(false);
        if header.sequence != expected || header.sequence > header.total || total_changed {
            self.reset();
            return Err(SppError::SequenceDiscontinuity {
                expected,
                got: header.sequence,
            });
        }

        if header.sequence == 1 {
            let mut data = Vec::new();
            data.try_reserve_exact(fragment_capacity(mtu) * header.total as usize)?;
            self.buffer = Some(ReassemblyBuffer {
                total: header.total,
                next: 1,
                data,
            });
        }

        let Some(buffer) = self.buffer.as_mut() else {
            // sequence 1 always allocates above
            return Err(SppError::SequenceDiscontinuity {
                expected,
                got: header.sequence,
            });
        };
        buffer.data.extend_from_slice(payload);
        debug!(
            "fragment {}/{}, {} bytes accumulated",
            header.sequence,
            header.total,
            buffer.data.len()
        );

        if header.sequence == header.total {
            return Ok(self.buffer.take().map(|b| b.data));
        }
        buffer.next += 1;
        Ok(None)
    }

    /// Drop any message in flight.
    pub fn reset(&mut self) {
        if let Some(b) = self.buffer.take() {
            error!(
                "discarding partial message, {} bytes of fragment {}/{}",
                b.data.len(),
                b.next,
                b.total
            );
        }
    }

    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn accumulated(&self) -> usize {
        self.buffer.as_ref().map(|b| b.data.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    const MTU: u16 = 23;

    fn fragment(total: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut res = vec![b'#', b'#', total, sequence];
        res.extend_from_slice(payload);
        res
    }

    #[test]
    fn unfragmented_value_is_passed_through() {
        let mut r = Reassembler::new();
        let out = r.push(b"hello", MTU).unwrap();
        assert_eq!(out.as_deref(), Some(&b"hello"[..]));
        assert!(!r.in_progress());
    }

    #[test]
    fn single_byte_hash_is_not_a_marker() {
        let mut r = Reassembler::new();
        let out = r.push(b"#", MTU).unwrap();
        assert_eq!(out.as_deref(), Some(&b"#"[..]));
    }

    #[test]
    fn three_fragments_in_order() {
        let cap = fragment_capacity(MTU);
        let a = vec![1u8; cap];
        let b = vec![2u8; cap];
        let c = vec![3u8; 5];

        let mut r = Reassembler::new();
        assert_eq!(r.push(&fragment(3, 1, &a), MTU).unwrap(), None);
        assert!(r.in_progress());
        assert_eq!(r.accumulated(), cap);
        assert_eq!(r.push(&fragment(3, 2, &b), MTU).unwrap(), None);
        let msg = r.push(&fragment(3, 3, &c), MTU).unwrap().unwrap();

        assert_eq!(msg.len(), 2 * cap + 5);
        assert_eq!(msg, [a, b, c].concat());
        assert!(!r.in_progress());
    }

    #[test]
    fn single_fragment_message_resets_counters() {
        let mut r = Reassembler::new();
        assert_eq!(
            r.push(&fragment(1, 1, b"abc"), MTU).unwrap().as_deref(),
            Some(&b"abc"[..])
        );
        // a following transfer starts again at sequence one
        assert_eq!(
            r.push(&fragment(1, 1, b"def"), MTU).unwrap().as_deref(),
            Some(&b"def"[..])
        );
    }

    #[test]
    fn gap_discards_message() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(&fragment(3, 1, b"aaaa"), MTU).unwrap(), None);
        match r.push(&fragment(3, 3, b"cccc"), MTU) {
            Err(SppError::SequenceDiscontinuity { expected: 2, got: 3 }) => {}
            x => panic!("unexpected {x:?}"),
        }
        assert!(!r.in_progress());
        assert_eq!(r.accumulated(), 0);
    }

    #[rstest]
    #[case::duplicate(&[1, 1])]
    #[case::out_of_order(&[1, 3, 2])]
    #[case::restart(&[1, 2, 1])]
    fn discontinuity_never_delivers(#[case] order: &[u8]) {
        let mut r = Reassembler::new();
        let mut delivered = 0;
        let mut failed = false;
        for seq in order {
            match r.push(&fragment(3, *seq, b"xy"), MTU) {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => {}
                Err(_) => failed = true,
            }
        }
        assert!(failed);
        assert_eq!(delivered, 0);
        assert!(!r.in_progress());
    }

    #[test]
    fn changed_total_is_a_discontinuity() {
        let mut r = Reassembler::new();
        r.push(&fragment(3, 1, b"a"), MTU).unwrap();
        assert!(r.push(&fragment(4, 2, b"b"), MTU).is_err());
        assert!(!r.in_progress());
    }

    #[rstest]
    #[case(b"##".to_vec())]
    #[case(b"##\x02".to_vec())]
    #[case(b"##\x00\x01abc".to_vec())]
    fn malformed_headers(#[case] value: Vec<u8>) {
        let mut r = Reassembler::new();
        r.push(&fragment(2, 1, b"a"), MTU).unwrap();
        assert!(matches!(
            r.push(&value, MTU),
            Err(SppError::MalformedFragment { .. })
        ));
        assert!(!r.in_progress());
    }

    #[test]
    fn plain_value_does_not_disturb_transfer() {
        let mut r = Reassembler::new();
        r.push(&fragment(2, 1, b"ab"), MTU).unwrap();
        assert_eq!(r.push(b"zz", MTU).unwrap().as_deref(), Some(&b"zz"[..]));
        assert_eq!(
            r.push(&fragment(2, 2, b"cd"), MTU).unwrap().as_deref(),
            Some(&b"abcd"[..])
        );
    }

    proptest! {
        #[test]
        fn in_order_fragments_concatenate(
            mtu in 8u16..=512,
            sizes in proptest::collection::vec(0usize..=505, 1..=20),
            seed in any::<u8>(),
        ) {
            let cap = fragment_capacity(mtu);
            let total = sizes.len() as u8;
            let payloads: Vec<Vec<u8>> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| vec![seed.wrapping_add(i as u8); (*s).min(cap)])
                .collect();

            let mut r = Reassembler::new();
            let mut delivered = Vec::new();
            for (i, p) in payloads.iter().enumerate() {
                if let Some(x) = r.push(&fragment(total, i as u8 + 1, p), mtu).unwrap() {
                    delivered.push(x);
                }
            }
            prop_assert_eq!(delivered.len(), 1);
            prop_assert_eq!(delivered[0].len(), payloads.iter().map(Vec::len).sum::<usize>());
            prop_assert_eq!(&delivered[0], &payloads.concat());
            prop_assert!(!r.in_progress());
        }

        #[test]
        fn skipped_fragment_never_delivers(total in 3u8..=30, skip in 2u8..=29) {
            prop_assume!(skip < total);
            let mut r = Reassembler::new();
            for seq in (1..=total).filter(|s| *s != skip) {
                if let Ok(Some(_)) = r.push(&fragment(total, seq, b"data"), MTU) {
                    prop_assert!(false, "delivered a message with a gap");
                }
            }
            prop_assert!(!r.in_progress());
        }
    }
}
