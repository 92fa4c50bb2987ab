//! Resolved ownership trees.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ObjectRef, Uid};

/// An object and the trees of everything that (transitively) owns it.
///
/// Only immutable properties are kept: name, namespace, UID and creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OwnerTree {
    pub reference: ObjectRef,
    pub creation_ts: i64,
    pub owners: Vec<OwnerTree>,
}

impl OwnerTree {
    pub fn leaf(reference: ObjectRef) -> Self { Self { reference, creation_ts: 0, owners: Vec::new() } }

    pub fn with_owner(mut self, owner: OwnerTree) -> Self {
        self.owners.push(owner);
        self
    }

    /// UIDs in claim-resolution order: the object itself, then each owner subtree pre-order.
    pub fn uids(&self) -> Vec<Uid> {
        let mut out = Vec::new();
        self.collect_uids(&mut out);
        out
    }

    fn collect_uids(&self, out: &mut Vec<Uid>) {
        out.push(self.reference.uid.clone());
        for owner in &self.owners {
            owner.collect_uids(out);
        }
    }

    fn write_lines(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > 0 {
            writeln!(f)?;
        }
        write!(f, "{:indent$}{}:{}", "", self.reference.kind, self.reference.name, indent = depth * 2)?;
        for owner in &self.owners {
            owner.write_lines(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for OwnerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.write_lines(f, 0) }
}
