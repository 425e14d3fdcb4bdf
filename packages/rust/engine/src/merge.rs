use subst_shared::Node;

/// Merge `overlay` into `base`.
///
/// Mappings merge key by key; any other pairing is replaced by `overlay`.
pub fn deep_merge(base: &mut Node, overlay: Node) {
    match (base, overlay) {
        (Node::Mapping(base), Node::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
