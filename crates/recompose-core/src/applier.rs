//! The surface a composition drives to mirror its node groups into an
//! externally owned tree.
//!
//! Calls arrive in the order the composer decided them. Indices are always
//! relative to the children of the node most recently entered with
//! [`Applier::down`], or of the root when no node was entered.

/// Deferred change to a node, produced by an `Updater` during a pass.
pub type NodeUpdate<N> = Box<dyn FnOnce(&N)>;

/// Every new node is reported twice, once before and once after its
/// children. An applier attaches it in one of the two calls and ignores the
/// other, whichever suits how its tree is built.
pub trait Applier {
    /// Handle to a node of the target tree. Cloned freely by the composer,
    /// so it is usually an id or a reference-counted pointer.
    type Node: Clone + 'static;

    /// Makes `node` the parent for the following calls.
    fn down(&mut self, node: &Self::Node);

    /// Returns to the parent that was current before the matching `down`.
    fn up(&mut self);

    /// Inserts `node` before its children are built.
    fn insert_top_down(&mut self, index: usize, node: &Self::Node);

    /// Inserts `node` after its children are built.
    fn insert_bottom_up(&mut self, index: usize, node: &Self::Node);

    fn remove(&mut self, index: usize, count: usize);

    /// Moves `count` children starting at `from` so they start at `to`.
    /// `to` is measured before the moved children are taken out.
    fn move_nodes(&mut self, from: usize, to: usize, count: usize);

    /// Removes every node.
    fn clear(&mut self);

    /// Applies a property change recorded for `node`.
    fn update(&mut self, node: &Self::Node, change: NodeUpdate<Self::Node>) {
        change(node);
    }

    /// Called before the first change of a committed pass.
    fn on_begin_changes(&mut self) {}

    /// Called after the last change of a committed pass.
    fn on_end_changes(&mut self) {}
}

/// Applies [`Applier::move_nodes`] to a plain child list.
pub fn move_range<T>(children: &mut Vec<T>, from: usize, to: usize, count: usize) {
    if count == 0 || from == to {
        return;
    }
    let moved: Vec<T> = children.drain(from..from + count).collect();
    let dest = if from > to { to } else { to - count };
    for (offset, item) in moved.into_iter().enumerate() {
        children.insert(dest + offset, item);
    }
}

#[cfg(test)]
mod tests {
    use super::move_range;

    #[test]
    fn move_range_toward_front() {
        let mut items = vec!['a', 'b', 'c', 'd', 'e'];
        move_range(&mut items, 3, 1, 2);
        assert_eq!(items, vec!['a', 'd', 'e', 'b', 'c']);
    }

    #[test]
    fn move_range_toward_back() {
        let mut items = vec!['a', 'b', 'c', 'd', 'e'];
        move_range(&mut items, 0, 3, 1);
        assert_eq!(items, vec!['b', 'c', 'a', 'd', 'e']);
    }
}
