//! Splitting advertising payloads into HCI-sized fragments.

use crate::config::ADV_DATA_LEN_MAX;
use crate::hci::Operation;

/// Iterator over the fragments of an advertising payload.
///
/// Yields `(operation, chunk)` pairs where every chunk except the final one
/// is exactly [`ADV_DATA_LEN_MAX`] bytes. A payload that fits in one
/// fragment is tagged [`Operation::Complete`]; longer payloads follow
/// `First Intermediate* Last`. The empty payload still yields a single
/// empty `Complete` fragment, since the controller must be told the data is
/// now empty.
pub(crate) struct Fragments<'d> {
    data: &'d [u8],
    offset: usize,
    first: bool,
}

impl<'d> Fragments<'d> {
    pub(crate) fn new(data: &'d [u8]) -> Self {
        Self {
            data,
            offset: 0,
            first: true,
        }
    }
}

impl<'d> Iterator for Fragments<'d> {
    type Item = (Operation, &'d [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.first && self.offset == self.data.len() {
            return None;
        }

        let remaining = self.data.len() - self.offset;
        let more = remaining > ADV_DATA_LEN_MAX;
        let operation = match (self.first, more) {
            (true, false) => Operation::Complete,
            (true, true) => Operation::First,
            (false, true) => Operation::Intermediate,
            (false, false) => Operation::Last,
        };

        let len = remaining.min(ADV_DATA_LEN_MAX);
        let chunk = &self.data[self.offset..self.offset + len];
        self.offset += len;
        self.first = false;
        Some((operation, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec::Vec;

    fn trace(data: &[u8]) -> Vec<(Operation, usize)> {
        Fragments::new(data).map(|(op, chunk)| (op, chunk.len())).collect()
    }

    #[test]
    fn empty_payload_is_one_complete_fragment() {
        assert_eq!(trace(&[]), [(Operation::Complete, 0)]);
    }

    #[test]
    fn payload_at_the_limit_is_complete() {
        assert_eq!(trace(&[0xaa; 251]), [(Operation::Complete, 251)]);
    }

    #[test]
    fn payload_over_the_limit_splits() {
        assert_eq!(trace(&[0xaa; 252]), [(Operation::First, 251), (Operation::Last, 1)]);
        assert_eq!(trace(&[0xaa; 500]), [(Operation::First, 251), (Operation::Last, 249)]);
        assert_eq!(
            trace(&[0xaa; 503]),
            [
                (Operation::First, 251),
                (Operation::Intermediate, 251),
                (Operation::Last, 1)
            ]
        );
    }

    #[test]
    fn fragments_reassemble_to_the_payload() {
        let data: Vec<u8> = (0..1337u16).map(|v| v as u8).collect();
        let mut rebuilt = Vec::new();
        let mut sizes = Vec::new();
        for (_, chunk) in Fragments::new(&data) {
            rebuilt.extend_from_slice(chunk);
            sizes.push(chunk.len());
        }
        assert_eq!(rebuilt, data);
        // Every fragment but the final one is full-sized.
        for size in &sizes[..sizes.len() - 1] {
            assert_eq!(*size, ADV_DATA_LEN_MAX);
        }
    }
}
