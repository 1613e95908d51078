// Test fixtures and data generators for integration tests

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::acl::{tag, AclEntry, PosixAcl, ACL_UNDEFINED_ID};
use tessera::types::ObjectIdentity;

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// An identity with arbitrary 64-bit formal id and generation.
    pub fn identity(&mut self) -> ObjectIdentity {
        ObjectIdentity::new(self.rng.gen(), self.rng.gen())
    }

    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes[..]);
        bytes
    }

    /// Token words of a length that is not 3, 5 or 6.
    pub fn bad_token(&mut self) -> Vec<u32> {
        let len = loop {
            let len = self.rng.gen_range(0..12);
            if !matches!(len, 3 | 5 | 6) {
                break len;
            }
        };
        (0..len).map(|_| self.rng.gen()).collect()
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// Owner rwx, a named user, group r-x, mask and other as given.
pub fn extended_acl(named_uid: u32, mask: u16, other: u16) -> PosixAcl {
    PosixAcl::new(vec![
        AclEntry::new(tag::USER_OBJ, 7, ACL_UNDEFINED_ID),
        AclEntry::new(tag::USER, 7, named_uid),
        AclEntry::new(tag::GROUP_OBJ, 5, ACL_UNDEFINED_ID),
        AclEntry::new(tag::MASK, mask, ACL_UNDEFINED_ID),
        AclEntry::new(tag::OTHER, other, ACL_UNDEFINED_ID),
    ])
}
