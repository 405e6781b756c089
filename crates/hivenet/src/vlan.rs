//! VLAN ID set algebra.
//!
//! A `VidSet` tracks which of the 4094 usable 802.1Q tags are active on a
//! bridge. Two modes exist: an access (single-tag) set holding exactly one
//! tag, and a trunk set backed by a fixed 4096-entry bitmap. The bitmap
//! keeps membership, union, and diff at O(4096) worst case regardless of
//! sparsity, which is bounded by the 12-bit tag space.
//!
//! Tag 0 means "untagged" and is never a member. Tag 1 is the default PVID;
//! it can be a member, but `diff` treats it as implicit and never reports it.

use sha2::{Digest, Sha256};

use crate::error::{NetError, Result};

/// Highest usable VLAN tag.
pub const VID_MAX: u16 = 4094;

/// Bitmap size (tags 0..=4095; 4095 is reserved by the protocol).
const TABLE_SIZE: usize = 4096;

/// Set mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VidMode {
    /// Single untagged/access VLAN.
    Access,
    /// Full trunk bitmap.
    Trunk,
}

/// A set of VLAN tags on one bridge.
#[derive(Clone)]
pub struct VidSet {
    mode: VidMode,
    /// Valid only in access mode. 0 means "no tag set yet".
    tag: u16,
    /// Valid only in trunk mode.
    bits: Box<[bool; TABLE_SIZE]>,
    /// Cached cardinality, never counting tag 0.
    count: usize,
}

impl std::fmt::Debug for VidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VidSet")
            .field("mode", &self.mode)
            .field("count", &self.count)
            .finish()
    }
}

impl Default for VidSet {
    fn default() -> Self {
        Self::new()
    }
}

impl VidSet {
    /// Creates an empty trunk set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: VidMode::Trunk,
            tag: 0,
            bits: Box::new([false; TABLE_SIZE]),
            count: 0,
        }
    }

    /// Creates an access set holding one tag.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the tag is outside [0, 4094].
    pub fn access(vid: u16) -> Result<Self> {
        if vid > VID_MAX {
            return Err(NetError::OutOfRange(i64::from(vid)));
        }
        Ok(Self {
            mode: VidMode::Access,
            tag: vid,
            bits: Box::new([false; TABLE_SIZE]),
            count: usize::from(vid != 0),
        })
    }

    /// Reconstructs a trunk set from the comma-joined form of `to_string`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if any element is not a tag in [0, 4094].
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let vid: u16 = part
                .parse()
                .map_err(|_| NetError::OutOfRange(part.parse::<i64>().unwrap_or(-1)))?;
            set.set_vid(vid)?;
        }
        Ok(set)
    }

    /// Returns the set mode.
    #[must_use]
    pub fn mode(&self) -> VidMode {
        self.mode
    }

    /// Returns the number of member tags (tag 0 never counted).
    #[must_use]
    pub fn vlan_count(&self) -> usize {
        self.count
    }

    /// Returns true if the tag is a member.
    #[must_use]
    pub fn contains(&self, vid: u16) -> bool {
        if vid == 0 || vid > VID_MAX {
            return false;
        }
        match self.mode {
            VidMode::Access => self.tag == vid,
            VidMode::Trunk => self.bits[usize::from(vid)],
        }
    }

    /// Adds a tag to the set.
    ///
    /// Tag 0 is a silent no-op. In access mode the single tag is replaced.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the tag is outside [0, 4094].
    pub fn set_vid(&mut self, vid: u16) -> Result<()> {
        if vid > VID_MAX {
            return Err(NetError::OutOfRange(i64::from(vid)));
        }
        if vid == 0 {
            return Ok(());
        }
        match self.mode {
            VidMode::Access => {
                if self.tag != vid {
                    self.tag = vid;
                    self.count = 1;
                }
            }
            VidMode::Trunk => {
                if !self.bits[usize::from(vid)] {
                    self.bits[usize::from(vid)] = true;
                    self.count += 1;
                }
            }
        }
        Ok(())
    }

    /// Removes a tag from the set.
    ///
    /// Tag 0 and absent tags are silent no-ops.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if the tag is outside [0, 4094].
    pub fn unset_vid(&mut self, vid: u16) -> Result<()> {
        if vid > VID_MAX {
            return Err(NetError::OutOfRange(i64::from(vid)));
        }
        if vid == 0 {
            return Ok(());
        }
        match self.mode {
            VidMode::Access => {
                if self.tag == vid {
                    self.tag = 0;
                    self.count = 0;
                }
            }
            VidMode::Trunk => {
                if self.bits[usize::from(vid)] {
                    self.bits[usize::from(vid)] = false;
                    self.count -= 1;
                }
            }
        }
        Ok(())
    }

    /// Merges `other` into this set.
    ///
    /// A single-tag `other` degrades to one `set_vid` call.
    ///
    /// # Errors
    ///
    /// Returns `Mode` if this set is not in trunk mode.
    pub fn append(&mut self, other: &VidSet) -> Result<()> {
        if self.mode != VidMode::Trunk {
            return Err(NetError::Mode("append target must be a trunk set".into()));
        }
        match other.mode {
            VidMode::Access => self.set_vid(other.tag),
            VidMode::Trunk => {
                for vid in 1..=VID_MAX {
                    if other.bits[usize::from(vid)] {
                        self.set_vid(vid)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Computes the incremental difference against `existing`.
    ///
    /// Tags in `self` but not `existing` go to `added`; tags in `existing`
    /// but not `self` go to `removed`. Tag 1 is the implicit default PVID
    /// and is excluded from both sides.
    ///
    /// # Errors
    ///
    /// Returns `Mode` unless both sets are in trunk mode.
    pub fn diff(&self, existing: &VidSet) -> Result<(VidSet, VidSet)> {
        if self.mode != VidMode::Trunk || existing.mode != VidMode::Trunk {
            return Err(NetError::Mode("diff requires two trunk sets".into()));
        }
        let mut added = VidSet::new();
        let mut removed = VidSet::new();
        for vid in 2..=VID_MAX {
            let want = self.bits[usize::from(vid)];
            let have = existing.bits[usize::from(vid)];
            if want && !have {
                added.set_vid(vid)?;
            } else if have && !want {
                removed.set_vid(vid)?;
            }
        }
        Ok((added, removed))
    }

    /// Invokes `f` for each member tag > 1 in ascending order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first callback error.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u16) -> Result<()>,
    {
        match self.mode {
            VidMode::Access => {
                if self.tag > 1 {
                    f(self.tag)?;
                }
            }
            VidMode::Trunk => {
                for vid in 2..=VID_MAX {
                    if self.bits[usize::from(vid)] {
                        f(vid)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Canonical comma-joined ascending list of member tags > 1.
    #[must_use]
    pub fn to_vid_string(&self) -> String {
        let mut out = String::new();
        // walk never fails with an infallible callback
        let _ = self.walk(|vid| {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&vid.to_string());
            Ok(())
        });
        out
    }

    /// Stable content hash of `to_vid_string`, for cheap equality checks
    /// against a persisted annotation.
    #[must_use]
    pub fn to_vid_string_hash(&self) -> String {
        let digest = Sha256::digest(self.to_vid_string().as_bytes());
        let mut out = String::with_capacity(16);
        for b in &digest[..8] {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl std::fmt::Display for VidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_vid_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_vid_bounds() {
        let mut set = VidSet::new();
        assert!(set.set_vid(4095).is_err());
        assert!(matches!(set.set_vid(4095), Err(NetError::OutOfRange(_))));
        for vid in [1u16, 2, 100, 4094] {
            set.set_vid(vid).unwrap();
            assert!(set.contains(vid));
        }
        assert_eq!(set.vlan_count(), 4);
    }

    #[test]
    fn test_vid_zero_is_noop() {
        let mut set = VidSet::new();
        set.set_vid(0).unwrap();
        assert_eq!(set.vlan_count(), 0);
        assert!(!set.contains(0));
        set.unset_vid(0).unwrap();
        assert_eq!(set.vlan_count(), 0);

        let access = VidSet::access(0).unwrap();
        assert_eq!(access.vlan_count(), 0);
    }

    #[test]
    fn test_set_vid_idempotent_count() {
        let mut set = VidSet::new();
        set.set_vid(300).unwrap();
        set.set_vid(300).unwrap();
        assert_eq!(set.vlan_count(), 1);
        set.unset_vid(300).unwrap();
        set.unset_vid(300).unwrap();
        assert_eq!(set.vlan_count(), 0);
    }

    #[test]
    fn test_append_requires_trunk() {
        let mut access = VidSet::access(5).unwrap();
        let trunk = VidSet::new();
        assert!(matches!(access.append(&trunk), Err(NetError::Mode(_))));
    }

    #[test]
    fn test_append_single_and_trunk() {
        let mut a = VidSet::new();
        a.append(&VidSet::access(10).unwrap()).unwrap();
        assert!(a.contains(10));

        let mut b = VidSet::new();
        b.set_vid(20).unwrap();
        b.set_vid(30).unwrap();
        a.append(&b).unwrap();
        assert_eq!(a.vlan_count(), 3);

        // Order of merging does not change membership.
        let mut c = VidSet::new();
        c.append(&b).unwrap();
        c.append(&VidSet::access(10).unwrap()).unwrap();
        assert_eq!(c.to_vid_string(), a.to_vid_string());
    }

    #[test]
    fn test_diff_basic() {
        let mut desired = VidSet::new();
        for vid in [2u16, 3, 4] {
            desired.set_vid(vid).unwrap();
        }
        let mut existing = VidSet::new();
        for vid in [3u16, 5] {
            existing.set_vid(vid).unwrap();
        }

        let (added, removed) = desired.diff(&existing).unwrap();
        assert_eq!(added.to_vid_string(), "2,4");
        assert_eq!(removed.to_vid_string(), "5");

        // existing ∪ added \ removed == desired, restricted to tags > 1
        let mut rebuilt = VidSet::new();
        rebuilt.append(&existing).unwrap();
        rebuilt.append(&added).unwrap();
        removed.walk(|vid| rebuilt.unset_vid(vid)).unwrap();
        assert_eq!(rebuilt.to_vid_string(), desired.to_vid_string());
    }

    #[test]
    fn test_diff_excludes_pvid() {
        let mut desired = VidSet::new();
        desired.set_vid(1).unwrap();
        desired.set_vid(2).unwrap();
        let mut existing = VidSet::new();
        existing.set_vid(1).unwrap();
        existing.set_vid(3).unwrap();

        let (added, removed) = desired.diff(&existing).unwrap();
        assert!(!added.contains(1));
        assert!(!removed.contains(1));
        assert_eq!(added.to_vid_string(), "2");
        assert_eq!(removed.to_vid_string(), "3");
    }

    #[test]
    fn test_diff_requires_trunk() {
        let access = VidSet::access(5).unwrap();
        let trunk = VidSet::new();
        assert!(matches!(trunk.diff(&access), Err(NetError::Mode(_))));
        assert!(matches!(access.diff(&trunk), Err(NetError::Mode(_))));
    }

    #[test]
    fn test_string_round_trip() {
        let mut set = VidSet::new();
        for vid in [4094u16, 7, 2, 100] {
            set.set_vid(vid).unwrap();
        }
        let s = set.to_vid_string();
        assert_eq!(s, "2,7,100,4094");

        let parsed = VidSet::parse(&s).unwrap();
        assert_eq!(parsed.to_vid_string(), s);
        assert_eq!(parsed.to_vid_string_hash(), set.to_vid_string_hash());

        let mut other = VidSet::new();
        other.set_vid(2).unwrap();
        assert_ne!(other.to_vid_string_hash(), set.to_vid_string_hash());
    }

    #[test]
    fn test_walk_ascending_and_error() {
        let mut set = VidSet::new();
        for vid in [1u16, 9, 3, 500] {
            set.set_vid(vid).unwrap();
        }
        let mut seen = Vec::new();
        set.walk(|vid| {
            seen.push(vid);
            Ok(())
        })
        .unwrap();
        // Tag 1 is implicit and never walked.
        assert_eq!(seen, vec![3, 9, 500]);

        let err = set.walk(|_| Err(NetError::Mode("stop".into())));
        assert!(err.is_err());
    }
}
