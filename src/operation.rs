use crate::message::MessageType;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Enum that represents the access a processor asks for on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    /// Function that picks a read or a write with equal probability.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.random_bool(0.5) {
            Self::Write
        } else {
            Self::Read
        }
    }

    /// Function that returns the request type sent to the primary for this operation.
    pub fn request_type(&self) -> MessageType {
        match self {
            Self::Read => MessageType::ReadRequest,
            Self::Write => MessageType::WriteRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn generates_both_operations() {
        let mut rng = SmallRng::seed_from_u64(7);
        let ops: Vec<Operation> = (0..64).map(|_| Operation::generate(&mut rng)).collect();
        assert!(ops.contains(&Operation::Read));
        assert!(ops.contains(&Operation::Write));
        assert_eq!(Operation::Write.request_type(), MessageType::WriteRequest);
    }
}
