use log::warn;

/// Largest value the store accepts for a single bytea field.
pub const MAX_BLOB_BYTES: usize = 1_073_741_823;

/// Binary companion products of one detection. A missing companion file
/// yields empty bytes, not an error; `None` means the blob was dropped for
/// size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductSet {
    pub cube: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
    pub mom0: Option<Vec<u8>>,
    pub mom1: Option<Vec<u8>>,
    pub mom2: Option<Vec<u8>>,
    pub chan: Option<Vec<u8>>,
    pub spec: Option<Vec<u8>>,
    pub pv: Option<Vec<u8>>,
}

impl ProductSet {
    fn blob_len(blob: &Option<Vec<u8>>) -> usize {
        blob.as_ref().map(Vec::len).unwrap_or(0)
    }

    fn total_len(&self) -> usize {
        Self::blob_len(&self.cube)
            + Self::blob_len(&self.mask)
            + Self::blob_len(&self.mom0)
            + Self::blob_len(&self.mom1)
            + Self::blob_len(&self.mom2)
            + Self::blob_len(&self.chan)
            + Self::blob_len(&self.spec)
            + Self::blob_len(&self.pv)
    }

    /// Enforce the store's bytea limits. Oversized blobs are dropped
    /// individually first; if the aggregate still exceeds the limit the
    /// lower-priority blobs (cube, mask, channel map) are dropped while the
    /// core science products (moments, spectrum, position-velocity) are
    /// retained. Returns `None` when even the reduced set is too large, in
    /// which case the whole product row is skipped.
    pub fn capped(mut self, detection_id: i64) -> Option<ProductSet> {
        for (label, blob) in [
            ("cube", &mut self.cube),
            ("mask", &mut self.mask),
            ("mom0", &mut self.mom0),
            ("mom1", &mut self.mom1),
            ("mom2", &mut self.mom2),
            ("chan", &mut self.chan),
            ("spec", &mut self.spec),
            ("pv", &mut self.pv),
        ] {
            if Self::blob_len(blob) >= MAX_BLOB_BYTES {
                warn!("{label} for detection {detection_id} too large, ignoring");
                *blob = None;
            }
        }

        if self.total_len() >= MAX_BLOB_BYTES {
            self.cube = None;
            self.mask = None;
            self.chan = None;
            if self.total_len() >= MAX_BLOB_BYTES {
                warn!("products for detection {detection_id} too large, ignoring");
                return None;
            }
        }

        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; len])
    }

    #[test]
    fn small_products_pass_through_unchanged() {
        let set = ProductSet {
            cube: blob(10),
            mask: blob(10),
            mom0: blob(10),
            spec: blob(10),
            ..ProductSet::default()
        };
        assert_eq!(set.clone().capped(1), Some(set));
    }

    #[test]
    fn oversized_aggregate_drops_low_priority_blobs() {
        let half = MAX_BLOB_BYTES / 2 + 1;
        let set = ProductSet {
            cube: blob(half),
            mask: blob(half),
            mom0: blob(16),
            mom1: blob(16),
            spec: blob(16),
            ..ProductSet::default()
        };
        let capped = set.capped(7).unwrap();
        assert_eq!(capped.cube, None);
        assert_eq!(capped.mask, None);
        assert_eq!(capped.chan, None);
        assert_eq!(capped.mom0, blob(16));
        assert_eq!(capped.mom1, blob(16));
        assert_eq!(capped.spec, blob(16));
    }

    #[test]
    fn oversized_core_set_skips_the_row() {
        let set = ProductSet {
            mom0: blob(MAX_BLOB_BYTES / 2 + 1),
            mom1: blob(MAX_BLOB_BYTES / 2 + 1),
            ..ProductSet::default()
        };
        assert_eq!(set.capped(7), None);
    }

    #[test]
    fn individually_oversized_blob_is_dropped_first() {
        let set = ProductSet {
            cube: blob(MAX_BLOB_BYTES),
            mom0: blob(8),
            ..ProductSet::default()
        };
        let capped = set.capped(3).unwrap();
        assert_eq!(capped.cube, None);
        assert_eq!(capped.mom0, blob(8));
    }
}
