//! Before/after padding records for configure-time invariant checks.

use crate::border::PaddingSize;
use crate::error::WindowError;
use crate::tensor_info::TensorInfo;

/// Padding of a fixed list of operands, captured before window
/// configuration so the result can be checked against it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaddingSnapshot {
    paddings: Vec<PaddingSize>,
}

impl PaddingSnapshot {
    pub fn capture<'a>(infos: impl IntoIterator<Item = &'a TensorInfo>) -> Self {
        Self { paddings: infos.into_iter().map(TensorInfo::padding).collect() }
    }

    pub fn len(&self) -> usize {
        self.paddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paddings.is_empty()
    }

    pub fn get(&self, operand: usize) -> Option<PaddingSize> {
        self.paddings.get(operand).copied()
    }

    /// `true` if any operand's padding differs from the snapshot.
    pub fn has_padding_changed<'a>(&self, infos: impl IntoIterator<Item = &'a TensorInfo>) -> bool {
        let current: Vec<PaddingSize> = infos.into_iter().map(TensorInfo::padding).collect();
        current != self.paddings
    }

    /// Fail if any operand lost padding on any side since the snapshot.
    /// Growth is allowed.
    pub fn verify_not_shrunk<'a>(
        &self,
        infos: impl IntoIterator<Item = &'a TensorInfo>,
    ) -> Result<(), WindowError> {
        let current: Vec<PaddingSize> = infos.into_iter().map(TensorInfo::padding).collect();
        if current.len() != self.paddings.len() {
            return Err(WindowError::SnapshotMismatch {
                expected: self.paddings.len(),
                actual: current.len(),
            });
        }
        for (operand, (before, after)) in self.paddings.iter().zip(&current).enumerate() {
            if !after.covers(before) {
                return Err(WindowError::PaddingShrunk { operand, before: *before, after: *after });
            }
        }
        Ok(())
    }
}
