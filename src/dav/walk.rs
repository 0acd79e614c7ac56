//! 深度受限的目录树遍历，显式栈实现，按前序逐个产出节点。

use super::VirtualPath;
use super::headers::Depth;
use crate::drive::ObjectMetadata;
use crate::resolver::{PathResolver, ResolveError};

/// One visited node and, for folders inside the depth bound, its children.
pub struct WalkEntry {
    pub path: VirtualPath,
    pub node: ObjectMetadata,
    pub children: Vec<ObjectMetadata>,
}

pub struct TreeWalk<'a> {
    resolver: &'a PathResolver,
    stack: Vec<(VirtualPath, ObjectMetadata, usize)>,
    max_level: Option<usize>,
}

impl<'a> TreeWalk<'a> {
    pub fn new(
        resolver: &'a PathResolver,
        path: VirtualPath,
        node: ObjectMetadata,
        depth: Depth,
    ) -> Self {
        let max_level = match depth {
            Depth::Zero => Some(0),
            Depth::One => Some(1),
            Depth::Infinity => None,
        };
        Self {
            resolver,
            stack: vec![(path, node, 0)],
            max_level,
        }
    }

    /// 下一个节点；遍历结束返回 None。
    pub async fn next(&mut self) -> Option<Result<WalkEntry, ResolveError>> {
        let (path, node, level) = self.stack.pop()?;
        let descend = node.is_folder() && self.max_level.is_none_or(|max| level < max);
        let children = if descend {
            match self.resolver.list(&node, &path).await {
                Ok(children) => children,
                Err(err) => return Some(Err(err)),
            }
        } else {
            Vec::new()
        };
        for child in children.iter().rev() {
            self.stack
                .push((path.join(&child.name), child.clone(), level + 1));
        }
        Some(Ok(WalkEntry {
            path,
            node,
            children,
        }))
    }
}
