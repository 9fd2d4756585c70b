/*!
The canonical SBP-2 unit directory.

Some target operating systems (Windows in particular) only honor physical
DMA requests from a host that advertises an SBP-2 capable unit in its own
configuration ROM. Publishing this directory on the local node makes such
targets willing to serve reads. The entries below are load-bearing down to
the bit; targets match on them literally.

Publication itself is a backend concern
([`FirewireBackend::publish_sbp2`](crate::backend::FirewireBackend::publish_sbp2));
backends that take a pre-formed descriptor block consume
[`directory_block`] whole, backends that add entries one by one skip the
leading header quadlet.
*/

/// The 13 key/value entries of the SBP-2 unit directory, in publication
/// order.
pub const UNIT_DIRECTORY: [(u32, u32); 13] = [
    (0x12, 0x00609e), // unit spec id
    (0x13, 0x010483), // unit sw version
    (0x21, 0x000001),
    (0x3a, 0x000a08),
    (0x3e, 0x004c10),
    (0x38, 0x00609e), // command set spec id
    (0x39, 0x0104d8), // command set
    (0x3b, 0x000000),
    (0x3c, 0x0a2700),
    (0x54, 0x004000), // management agent offset
    (0x3d, 0x000003),
    (0x14, 0x0e0000),
    (0x17, 0x000021), // model id
];

/// Number of quadlets in the pre-formed descriptor block.
pub const DIRECTORY_QUADLETS: usize = UNIT_DIRECTORY.len() + 1;

/// Builds the pre-formed descriptor block: a header quadlet carrying the
/// entry count and the IEEE 1212 CRC-16, followed by the 13 entries.
pub fn directory_block() -> [u32; DIRECTORY_QUADLETS] {
    let mut block = [0u32; DIRECTORY_QUADLETS];

    for (i, &(key, value)) in UNIT_DIRECTORY.iter().enumerate() {
        block[i + 1] = key << 24 | value;
    }

    block[0] = (UNIT_DIRECTORY.len() as u32) << 16 | u32::from(crc16(&block[1..]));

    block
}

/// The serial-bus CRC-16 of IEEE 1212, computed over quadlets 4 bits at a
/// time.
pub(crate) fn crc16(quadlets: &[u32]) -> u16 {
    let mut crc: u32 = 0;

    for &quadlet in quadlets {
        let mut shift = 28i32;
        while shift >= 0 {
            let sum = (crc >> 12 ^ quadlet >> shift) & 0xf;
            crc = (crc << 4 ^ sum << 12 ^ sum << 5 ^ sum) & 0xffff;
            shift -= 4;
        }
    }

    crc as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let block = directory_block();

        assert_eq!(block.len(), 14);
        assert_eq!(block[0] >> 16, 13);
        assert_eq!(block[0] & 0xffff, u32::from(crc16(&block[1..])));
    }

    #[test]
    fn test_block_entries() {
        let block = directory_block();

        for (i, &(key, value)) in UNIT_DIRECTORY.iter().enumerate() {
            assert_eq!(block[i + 1] >> 24, key);
            assert_eq!(block[i + 1] & 0x00ff_ffff, value);
        }

        // Spot checks against the canonical table
        assert_eq!(block[1], 0x1200_609e);
        assert_eq!(block[2], 0x1301_0483);
        assert_eq!(block[13], 0x1700_0021);
    }

    #[test]
    fn test_crc16_stability() {
        let block = directory_block();

        // The CRC is a pure function of the entries
        assert_eq!(crc16(&block[1..]), crc16(&directory_block()[1..]));
        assert_ne!(crc16(&block[1..]), crc16(&block[2..]));
    }
}
