//! COPY 与 MOVE。

use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tracing::info;

use super::headers::{Depth, Destination, overwrite_header, parse_depth, parse_destination};
use super::walk::TreeWalk;
use super::{DavHandler, VirtualPath, request_host};
use crate::drive::ObjectMetadata;
use crate::error::DavError;

/// How a COPY or MOVE maps onto backend calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transfer {
    /// Same parent, new name.
    Rename,
    /// Same name, new parent: one batch move call.
    Relocate,
    /// Both differ.
    General,
}

fn classify(src: &VirtualPath, dst: &VirtualPath) -> Transfer {
    if src.parent() == dst.parent() {
        Transfer::Rename
    } else if src.name() == dst.name() {
        Transfer::Relocate
    } else {
        Transfer::General
    }
}

impl DavHandler {
    pub(super) async fn handle_copy_move(
        &self,
        parts: &Parts,
        src: &VirtualPath,
    ) -> Result<Response, DavError> {
        let is_move = parts.method.as_str() == "MOVE";
        let raw = parts
            .headers
            .get("destination")
            .and_then(|value| value.to_str().ok())
            .ok_or(DavError::BadRequest)?;
        let dst = match parse_destination(raw, request_host(parts)).ok_or(DavError::BadRequest)? {
            Destination::OtherHost => return Err(DavError::BadGateway),
            Destination::Path(path) => VirtualPath::from_uri_path(&path, &self.config.prefix)
                .ok_or(DavError::BadGateway)?,
        };
        if src.is_root() || dst.is_root() || dst.is_within(src) {
            return Err(DavError::Forbidden);
        }

        let (depth, overwrite) = if is_move {
            if parse_depth(&parts.headers, Depth::Infinity)? != Depth::Infinity {
                return Err(DavError::BadRequest);
            }
            (Depth::Infinity, overwrite_header(&parts.headers) == Some("T"))
        } else {
            let depth = parse_depth(&parts.headers, Depth::Infinity)?;
            if depth == Depth::One {
                return Err(DavError::BadRequest);
            }
            (depth, overwrite_header(&parts.headers) != Some("F"))
        };

        let guard = if is_move {
            self.confirm_locks(parts, Some(src), Some(&dst)).await?
        } else {
            self.confirm_locks(parts, None, Some(&dst)).await?
        };
        let result = self
            .transfer(src, &dst, is_move, overwrite, depth)
            .await;
        guard.release();
        result
    }

    async fn transfer(
        &self,
        src: &VirtualPath,
        dst: &VirtualPath,
        is_move: bool,
        overwrite: bool,
        depth: Depth,
    ) -> Result<Response, DavError> {
        let source = self.resolver.resolve(src).await?;
        let dst_parent = self.existing_parent(dst).await?;
        let existing = self.lookup(dst).await?;
        let created = existing.is_none();
        if let Some(existing) = existing {
            if !overwrite {
                return Err(DavError::PreconditionFailed);
            }
            self.resolver.drive().trash(&existing.id).await?;
            self.resolver.cache().invalidate_tree(dst);
            self.props.remove_tree(dst);
            self.locks.remove_tree(dst);
        }

        let drive = self.resolver.drive();
        let transfer = classify(src, dst);
        match transfer {
            Transfer::Rename => drive.rename(&source.id, dst.name()).await?,
            Transfer::Relocate => drive.batch_move(&source.id, &dst_parent.id).await?,
            Transfer::General if is_move => {
                drive.move_to(&source.id, &dst_parent.id, dst.name()).await?
            }
            Transfer::General => {
                self.copy_tree(src, source.clone(), dst, &dst_parent.id, depth)
                    .await?
            }
        }

        let cache = self.resolver.cache();
        cache.invalidate_tree(dst);
        // 改名和批量移动对 COPY 同样会移走源对象。
        if is_move || transfer != Transfer::General {
            cache.invalidate_tree(src);
            self.props.move_tree(src, dst);
            self.locks.remove_tree(src);
        } else {
            self.props.copy_tree(src, dst, depth == Depth::Infinity);
        }
        info!(from = %src, to = %dst, id = source.id, ?transfer, is_move, "transfer finished");

        Ok(if created {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        }
        .into_response())
    }

    /// Recreates `src` under `dst_parent_id` one node at a time, bounded by `depth`.
    async fn copy_tree(
        &self,
        src: &VirtualPath,
        source: ObjectMetadata,
        dst: &VirtualPath,
        dst_parent_id: &str,
        depth: Depth,
    ) -> Result<(), DavError> {
        let drive = self.resolver.drive();
        let mut parents: HashMap<VirtualPath, String> = HashMap::new();
        parents.insert(dst.parent().unwrap_or_default(), dst_parent_id.to_string());

        let mut walk = TreeWalk::new(&self.resolver, src.clone(), source, depth);
        while let Some(entry) = walk.next().await {
            let entry = entry?;
            let target = entry.path.rebase(src, dst);
            let parent_id = parents
                .get(&target.parent().unwrap_or_default())
                .cloned()
                .ok_or_else(|| DavError::Internal(format!("no copied parent for {target}")))?;
            if entry.node.is_folder() {
                let folder = drive.create_folder(&parent_id, target.name()).await?;
                parents.insert(target, folder.id);
            } else {
                drive
                    .copy_to(&entry.node.id, &parent_id, target.name())
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dav::testing::{Harness, body_text};
    use crate::dav::xml::{PropName, PropPatch};
    use crate::drive::ROOT_ID;

    async fn send(harness: &Harness, method: &str, from: &str, headers: &[(&str, &str)]) -> Response {
        harness.send(method, from, headers, "").await
    }

    #[test]
    fn transfers_are_classified_by_parent_and_name() {
        let path = |raw: &str| VirtualPath::parse(raw).expect("path");
        assert_eq!(classify(&path("a/x"), &path("a/y")), Transfer::Rename);
        assert_eq!(classify(&path("a/x"), &path("b/x")), Transfer::Relocate);
        assert_eq!(classify(&path("a/x"), &path("b/y")), Transfer::General);
    }

    #[tokio::test]
    async fn copy_to_other_parent_with_same_name_is_one_batch_move() {
        let harness = Harness::new();
        let a = harness.drive.add_folder(ROOT_ID, "a");
        let b = harness.drive.add_folder(ROOT_ID, "b");
        harness.drive.add_file(&a, "x.txt", b"payload");

        let response = send(&harness, "COPY", "/a/x.txt", &[("destination", "/b/x.txt")]).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(harness.drive.calls("batch_move"), 1);
        assert_eq!(harness.drive.calls("copy_to"), 0);
        assert!(harness.drive.child(&b, "x.txt").is_some());

        let response = harness.send("GET", "/b/x.txt", &[], "").await;
        assert_eq!(body_text(response).await, "payload");
    }

    #[tokio::test]
    async fn move_within_a_folder_is_a_rename() {
        let harness = Harness::new();
        harness.drive.add_file(ROOT_ID, "a.txt", b"a");
        harness.send("GET", "/a.txt", &[], "").await;

        let response = send(&harness, "MOVE", "/a.txt", &[("destination", "http://localhost/b.txt")]).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(harness.drive.calls("rename"), 1);
        assert_eq!(harness.send("GET", "/a.txt", &[], "").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(harness.send("GET", "/b.txt", &[], "").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn general_move_uses_move_with_new_name() {
        let harness = Harness::new();
        let a = harness.drive.add_folder(ROOT_ID, "a");
        let b = harness.drive.add_folder(ROOT_ID, "b");
        let id = harness.drive.add_file(&a, "x.txt", b"x");

        let response = send(&harness, "MOVE", "/a/x.txt", &[("destination", "/b/y.txt")]).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(harness.drive.calls("move_to"), 1);
        assert_eq!(harness.drive.child(&b, "y.txt").map(|m| m.id), Some(id));
    }

    #[tokio::test]
    async fn general_copy_walks_the_tree_within_depth() {
        let harness = Harness::new();
        let src = harness.drive.add_folder(ROOT_ID, "src");
        let sub = harness.drive.add_folder(&src, "sub");
        harness.drive.add_file(&src, "a.txt", b"a");
        harness.drive.add_file(&sub, "b.txt", b"b");
        harness.drive.add_folder(ROOT_ID, "out");

        let response = send(&harness, "COPY", "/src", &[("destination", "/out/all")]).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(harness.drive.calls("copy_to"), 2);
        let response = harness.send("GET", "/out/all/sub/b.txt", &[], "").await;
        assert_eq!(body_text(response).await, "b");
        assert!(harness.drive.child(&src, "a.txt").is_some());

        let response = send(
            &harness,
            "COPY",
            "/src",
            &[("destination", "/out/shallow"), ("depth", "0")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(harness.drive.calls("copy_to"), 2);
        let response = harness
            .send("PROPFIND", "/out/shallow", &[("depth", "1")], "")
            .await;
        let xml = body_text(response).await;
        assert_eq!(xml.matches("<D:response>").count(), 1);
    }

    #[tokio::test]
    async fn shallow_copy_keeps_descendant_properties_behind() {
        let harness = Harness::new();
        let src = harness.drive.add_folder(ROOT_ID, "src");
        harness.drive.add_file(&src, "a.txt", b"a");
        let name = PropName {
            ns: "urn:z".into(),
            name: "color".into(),
        };
        let red = |path: &str| {
            harness.handler.props.apply(
                &VirtualPath::parse(path).expect("path"),
                &[PropPatch {
                    remove: false,
                    props: vec![(name.clone(), "red".into())],
                }],
            );
        };
        red("src");
        red("src/a.txt");

        let response = send(
            &harness,
            "COPY",
            "/src",
            &[("destination", "/shallow"), ("depth", "0")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let props = &harness.handler.props;
        let at = |path: &str| props.get(&VirtualPath::parse(path).expect("path"), &name);
        assert_eq!(at("shallow").as_deref(), Some("red"));
        assert!(at("shallow/a.txt").is_none());

        let response = send(&harness, "COPY", "/src", &[("destination", "/deep")]).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(at("deep/a.txt").as_deref(), Some("red"));
    }

    #[tokio::test]
    async fn existing_destination_needs_overwrite() {
        let harness = Harness::new();
        let a = harness.drive.add_folder(ROOT_ID, "a");
        harness.drive.add_file(&a, "x.txt", b"new");
        harness.drive.add_file(ROOT_ID, "x.txt", b"old");

        let response = send(&harness, "COPY", "/a/x.txt", &[("destination", "/x.txt"), ("overwrite", "F")]).await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        let response = send(&harness, "MOVE", "/a/x.txt", &[("destination", "/x.txt")]).await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

        let response = send(&harness, "MOVE", "/a/x.txt", &[("destination", "/x.txt"), ("overwrite", "T")]).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = harness.send("GET", "/x.txt", &[], "").await;
        assert_eq!(body_text(response).await, "new");
    }

    #[tokio::test]
    async fn destination_errors() {
        let harness = Harness::new();
        let a = harness.drive.add_folder(ROOT_ID, "a");
        harness.drive.add_file(&a, "x.txt", b"x");

        let cases: [(&str, &[(&str, &str)], StatusCode); 8] = [
            ("COPY", &[], StatusCode::BAD_REQUEST),
            ("COPY", &[("destination", "http://other/b"), ("host", "localhost")], StatusCode::BAD_GATEWAY),
            ("MOVE", &[("destination", "/a")], StatusCode::FORBIDDEN),
            ("MOVE", &[("destination", "/")], StatusCode::FORBIDDEN),
            ("MOVE", &[("destination", "/a/inner")], StatusCode::FORBIDDEN),
            ("MOVE", &[("destination", "/b"), ("depth", "0")], StatusCode::BAD_REQUEST),
            ("COPY", &[("destination", "/b"), ("depth", "1")], StatusCode::BAD_REQUEST),
            ("COPY", &[("destination", "/missing/b")], StatusCode::CONFLICT),
        ];
        for (method, headers, expected) in cases {
            let response = send(&harness, method, "/a", headers).await;
            assert_eq!(response.status(), expected, "{method} {headers:?}");
        }
        let response = send(&harness, "COPY", "/nope", &[("destination", "/b")]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
