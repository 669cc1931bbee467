//! The meta-page: the last map page in the map address space is never a
//! real translation table. It carries mount-time recovery hints instead,
//! so a fresh mount can trust certain facts about the volume without
//! re-deriving them from a full scan.

const META_MAGIC: u32 = 0x464C_4D31;
const TYPE_CONT_FORMAT: u32 = 1;
const TYPE_ERASED_LIST: u32 = 2;

/// Decoded contents of the meta page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetaPageBody {
    /// A format pass was interrupted while laying out `block`.
    ContFormat { block: u32 },
    /// Blocks known erased and free as of the write that produced this
    /// page, as `(block, wear_count)` pairs. Trusted without rescanning.
    ErasedList(Vec<(u32, u32)>),
}

impl MetaPageBody {
    pub(crate) fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0xFFu8; page_size];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        match self {
            MetaPageBody::ContFormat { block } => {
                buf[4..8].copy_from_slice(&TYPE_CONT_FORMAT.to_le_bytes());
                if buf.len() >= 12 {
                    buf[8..12].copy_from_slice(&block.to_le_bytes());
                }
            }
            MetaPageBody::ErasedList(entries) => {
                buf[4..8].copy_from_slice(&TYPE_ERASED_LIST.to_le_bytes());
                let mut off = 8;
                for &(block, wc) in entries {
                    if off + 8 > page_size {
                        break;
                    }
                    buf[off..off + 4].copy_from_slice(&block.to_le_bytes());
                    buf[off + 4..off + 8].copy_from_slice(&wc.to_le_bytes());
                    off += 8;
                }
                if off + 4 <= page_size {
                    buf[off..off + 4].copy_from_slice(&u32::MAX.to_le_bytes());
                }
            }
        }
        buf
    }

    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        if u32::from_le_bytes(data[0..4].try_into().unwrap()) != META_MAGIC {
            return None;
        }
        match u32::from_le_bytes(data[4..8].try_into().unwrap()) {
            TYPE_CONT_FORMAT if data.len() >= 12 => {
                let block = u32::from_le_bytes(data[8..12].try_into().unwrap());
                Some(MetaPageBody::ContFormat { block })
            }
            TYPE_ERASED_LIST => {
                let mut entries = Vec::new();
                let mut off = 8;
                while off + 8 <= data.len() {
                    let block = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
                    if block == u32::MAX {
                        break;
                    }
                    let wc = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap());
                    entries.push((block, wc));
                    off += 8;
                }
                Some(MetaPageBody::ErasedList(entries))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_list_round_trips() {
        let body = MetaPageBody::ErasedList(vec![(3, 10), (7, 2), (1, 0)]);
        let buf = body.encode(64);
        assert_eq!(MetaPageBody::decode(&buf), Some(body));
    }

    #[test]
    fn cont_format_round_trips() {
        let body = MetaPageBody::ContFormat { block: 42 };
        let buf = body.encode(64);
        assert_eq!(MetaPageBody::decode(&buf), Some(body));
    }

    #[test]
    fn unrelated_bytes_do_not_decode() {
        let buf = vec![0xFFu8; 64];
        assert_eq!(MetaPageBody::decode(&buf), None);
    }

    #[test]
    fn erased_list_truncates_to_page_capacity() {
        let entries: Vec<_> = (0..20).map(|b| (b, b)).collect();
        let body = MetaPageBody::ErasedList(entries);
        let buf = body.encode(32); // room for 3 entries + terminator
        match MetaPageBody::decode(&buf) {
            Some(MetaPageBody::ErasedList(got)) => assert!(got.len() <= 3),
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
