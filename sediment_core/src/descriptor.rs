//! Migration descriptors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::operation::Operation;

/// Errors raised while authoring or validating a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// The descriptor has no id.
    #[error("descriptor '{name}' has an empty id")]
    EmptyId {
        /// Name of the offending descriptor.
        name: String,
    },
    /// A reverse list was requested for an operation that has no inverse.
    #[error("descriptor {id}: cannot derive the reverse of '{operation}'")]
    Irreversible {
        /// Descriptor id.
        id: String,
        /// Description of the operation.
        operation: String,
    },
    /// A RecreateTable uses its source table name as the staging name.
    #[error("descriptor {id}: recreate of '{table}' must stage under a different name")]
    RecreateInPlace {
        /// Descriptor id.
        id: String,
        /// Table being recreated.
        table: String,
    },
}

/// Whether a forward step is checked against the live schema before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// Skip the step when the schema is already in the desired state.
    #[default]
    Guarded,
    /// Run the step unconditionally.
    Always,
}

impl Guard {
    fn is_default(&self) -> bool {
        *self == Guard::Guarded
    }
}

/// A forward operation and its guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// The operation.
    #[serde(flatten)]
    pub operation: Operation,
    /// How the operation is gated.
    #[serde(default, skip_serializing_if = "Guard::is_default")]
    pub guard: Guard,
}

/// A named, ordered schema change unit with forward and reverse operations.
///
/// Descriptors are immutable once built. Their `id` orders execution: ids
/// compare lexicographically, so timestamp-like ids (`2024_03_01_101500`)
/// keep authoring order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    id: String,
    name: String,
    forward: Vec<Step>,
    reverse: Vec<Operation>,
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    id: &'a str,
    name: &'a str,
    up: &'a [Step],
    down: &'a [Operation],
}

impl Descriptor {
    /// Starts a descriptor with no operations.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            forward: Vec::new(),
            reverse: Vec::new(),
        }
    }

    /// Appends a guarded forward operation.
    pub fn up(mut self, operation: Operation) -> Self {
        self.forward.push(Step {
            operation,
            guard: Guard::Guarded,
        });
        self
    }

    /// Appends a forward operation that runs without a schema check.
    pub fn up_always(mut self, operation: Operation) -> Self {
        self.forward.push(Step {
            operation,
            guard: Guard::Always,
        });
        self
    }

    /// Appends a forward step.
    pub fn step(mut self, step: Step) -> Self {
        self.forward.push(step);
        self
    }

    /// Appends a reverse operation. Reverse operations run in the order they
    /// were added.
    pub fn down(mut self, operation: Operation) -> Self {
        self.reverse.push(operation);
        self
    }

    /// Replaces the reverse list with the inverses of the forward steps, last
    /// step first.
    pub fn with_derived_reverse(mut self) -> Result<Self, DescriptorError> {
        let mut reverse = Vec::with_capacity(self.forward.len());
        for step in self.forward.iter().rev() {
            match step.operation.inverse() {
                Some(inverse) => reverse.push(inverse),
                None => {
                    return Err(DescriptorError::Irreversible {
                        id: self.id.clone(),
                        operation: step.operation.describe(),
                    });
                }
            }
        }
        self.reverse = reverse;
        Ok(self)
    }

    /// The ordering key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward steps, in execution order.
    pub fn forward(&self) -> &[Step] {
        &self.forward
    }

    /// Reverse operations, in execution order.
    pub fn reverse(&self) -> &[Operation] {
        &self.reverse
    }

    /// Checks the descriptor is well formed.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.id.trim().is_empty() {
            return Err(DescriptorError::EmptyId {
                name: self.name.clone(),
            });
        }
        let operations = self
            .forward
            .iter()
            .map(|s| &s.operation)
            .chain(self.reverse.iter());
        for operation in operations {
            if let Operation::RecreateTable { from, into, .. } = operation {
                if *from == into.name {
                    return Err(DescriptorError::RecreateInPlace {
                        id: self.id.clone(),
                        table: from.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form of the descriptor, for tamper
    /// detection. Computed before any table prefix is applied.
    pub fn checksum(&self) -> String {
        let view = ChecksumView {
            id: &self.id,
            name: &self.name,
            up: &self.forward,
            down: &self.reverse,
        };
        // Serializing plain data structures into a Vec cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// The same descriptor with the table prefix applied to every operation.
    pub fn with_prefix(&self, prefix: &str) -> Descriptor {
        Descriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            forward: self
                .forward
                .iter()
                .map(|step| Step {
                    operation: step.operation.with_prefix(prefix),
                    guard: step.guard,
                })
                .collect(),
            reverse: self
                .reverse
                .iter()
                .map(|op| op.with_prefix(prefix))
                .collect(),
        }
    }
}
