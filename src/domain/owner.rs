//! Task Ownership
//!
//! Owners scope task blocking: a blocking task claims its owner, and no
//! sibling under that owner (or under any descendant owner) may be
//! enqueued while the claim is held. Owners form a chain up to the
//! global root, e.g. plan -> workspace -> module -> global.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// The kind of entity a task is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Global,
    Module,
    Workspace,
    Plan,
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKind::Global => write!(f, "global"),
            OwnerKind::Module => write!(f, "module"),
            OwnerKind::Workspace => write!(f, "workspace"),
            OwnerKind::Plan => write!(f, "plan"),
        }
    }
}

/// One node in the ownership chain.
#[derive(Debug)]
pub struct Owner {
    id: Uuid,
    kind: OwnerKind,
    parent: Option<Arc<Owner>>,
}

impl Owner {
    /// A fresh global root owner.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind: OwnerKind::Global,
            parent: None,
        })
    }

    /// A child owner scoped under `parent`.
    #[must_use]
    pub fn child(parent: &Arc<Owner>, kind: OwnerKind) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            parent: Some(Arc::clone(parent)),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> OwnerKind {
        self.kind
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Owner>> {
        self.parent.as_ref()
    }

    /// This owner's id followed by every ancestor id up to the root.
    #[must_use]
    pub fn ancestor_ids(&self) -> Vec<Uuid> {
        let mut ids = vec![self.id];
        let mut current = self.parent.as_ref();
        while let Some(owner) = current {
            ids.push(owner.id);
            current = owner.parent.as_ref();
        }
        ids
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_chain() {
        let root = Owner::global();
        let module = Owner::child(&root, OwnerKind::Module);
        let workspace = Owner::child(&module, OwnerKind::Workspace);
        let plan = Owner::child(&workspace, OwnerKind::Plan);

        let ids = plan.ancestor_ids();
        assert_eq!(
            ids,
            vec![plan.id(), workspace.id(), module.id(), root.id()]
        );
    }

    #[test]
    fn test_root_has_no_parent() {
        let root = Owner::global();
        assert!(root.parent().is_none());
        assert_eq!(root.ancestor_ids(), vec![root.id()]);
        assert_eq!(root.kind(), OwnerKind::Global);
    }
}
