//! Operator failure types.

use thiserror::Error;

/// Error raised when a TLA+ operator is applied to incompatible values.
///
/// Every failing operator in this crate reports a `TypeError`. These are
/// fatal to the archetype that triggered them: generated code never handles
/// them, it lets them surface out of the run loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// An operand had the wrong variant for the operator.
    #[error("type mismatch in {op}: expected {expected}, found {found}")]
    Mismatch {
        /// Operator name as it appears in MPCal sources.
        op: &'static str,
        /// The variant the operator requires.
        expected: &'static str,
        /// The variant that was actually supplied.
        found: &'static str,
    },

    /// Integer arithmetic left the representable range.
    #[error("arithmetic overflow in {op}")]
    Overflow {
        /// Operator name.
        op: &'static str,
    },

    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Exponentiation with a negative exponent.
    #[error("negative exponent {exponent} in ^")]
    NegativeExponent {
        /// The offending exponent.
        exponent: i64,
    },

    /// 1-based sequence index outside `1..=len`.
    #[error("sequence index {index} out of range 1..={len}")]
    IndexOutOfRange {
        /// The requested index.
        index: i64,
        /// Length of the sequence.
        len: usize,
    },

    /// Function applied to a value outside its domain.
    #[error("function applied outside its domain: {key}")]
    OutOfDomain {
        /// Rendering of the missing key.
        key: String,
    },

    /// `Head`/`Tail` on an empty sequence.
    #[error("{op} on an empty sequence")]
    EmptySequence {
        /// Operator name.
        op: &'static str,
    },

    /// `CHOOSE` over a set with no element satisfying the predicate.
    #[error("CHOOSE found no satisfying element")]
    EmptyChoose,
}

impl TypeError {
    pub(crate) fn mismatch(op: &'static str, expected: &'static str, found: &'static str) -> Self {
        Self::Mismatch {
            op,
            expected,
            found,
        }
    }
}
