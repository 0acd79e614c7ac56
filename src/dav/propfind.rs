//! PROPFIND 与 PROPPATCH。

use axum::body::Body;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::Response;
use tracing::debug;

use super::headers::{Depth, parse_depth};
use super::props::{is_live, live_names, live_value};
use super::walk::TreeWalk;
use super::xml::{MultiStatus, PropName, PropStat, PropfindRequest, parse_propfind, parse_proppatch};
use super::{DavHandler, VirtualPath, multi_status, read_xml_body};
use crate::drive::ObjectMetadata;
use crate::error::DavError;
use crate::locks::ActiveLock;

impl DavHandler {
    pub(super) async fn handle_propfind(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        let body = read_xml_body(body).await?;
        let request = parse_propfind(&body)?;
        if request.is_quota_query() {
            return self.quota_response(path).await;
        }
        let depth = parse_depth(&parts.headers, Depth::Infinity)?;
        let meta = self.resolver.resolve(path).await?;
        self.propfind_response(path, meta, &request, depth).await
    }

    /// 配额查询不经过路径解析。
    async fn quota_response(&self, path: &VirtualPath) -> Result<Response, DavError> {
        let quota = self.resolver.drive().quota().await?;
        debug!(used = quota.used, total = quota.total, "quota reported");
        let mut multistatus = MultiStatus::new();
        multistatus.push_propstats(
            &self.href(path, true),
            &[PropStat {
                status: StatusCode::OK,
                props: vec![
                    PropName::dav("quota-available-bytes").element(&quota.available().to_string()),
                    PropName::dav("quota-used-bytes").element(&quota.used.to_string()),
                ],
            }],
        );
        Ok(multi_status(multistatus.finish()))
    }

    /// One response fragment per node the walk visits.
    pub(super) async fn propfind_response(
        &self,
        path: &VirtualPath,
        meta: ObjectMetadata,
        request: &PropfindRequest,
        depth: Depth,
    ) -> Result<Response, DavError> {
        let mut multistatus = MultiStatus::new();
        let mut walk = TreeWalk::new(&self.resolver, path.clone(), meta, depth);
        let mut count = 0usize;
        while let Some(entry) = walk.next().await {
            let entry = entry?;
            let locks = self.locks.discover(&entry.path);
            let propstats = self.propstats(&entry.path, &entry.node, &locks, request);
            multistatus.push_propstats(&self.href(&entry.path, entry.node.is_folder()), &propstats);
            count += 1;
        }
        debug!(path = %path, ?depth, count, "propfind");
        Ok(multi_status(multistatus.finish()))
    }

    fn propstats(
        &self,
        path: &VirtualPath,
        meta: &ObjectMetadata,
        locks: &[ActiveLock],
        request: &PropfindRequest,
    ) -> Vec<PropStat> {
        let prefix = self.config.prefix.as_str();
        match request {
            PropfindRequest::PropName => {
                let mut props: Vec<String> = live_names(meta).iter().map(PropName::empty).collect();
                props.extend(self.props.all(path).iter().map(|(name, _)| name.empty()));
                vec![PropStat {
                    status: StatusCode::OK,
                    props,
                }]
            }
            PropfindRequest::AllProp => {
                let mut props: Vec<String> = live_names(meta)
                    .iter()
                    .filter_map(|name| {
                        live_value(&name.name, meta, prefix, locks).map(|value| name.element(&value))
                    })
                    .collect();
                props.extend(
                    self.props
                        .all(path)
                        .iter()
                        .map(|(name, value)| name.element(value)),
                );
                vec![PropStat {
                    status: StatusCode::OK,
                    props,
                }]
            }
            PropfindRequest::Prop(names) => {
                let mut found = Vec::new();
                let mut missing = Vec::new();
                for name in names {
                    let value = if is_live(name) {
                        live_value(&name.name, meta, prefix, locks)
                    } else {
                        self.props.get(path, name)
                    };
                    match value {
                        Some(value) => found.push(name.element(&value)),
                        None => missing.push(name.empty()),
                    }
                }
                vec![
                    PropStat {
                        status: StatusCode::OK,
                        props: found,
                    },
                    PropStat {
                        status: StatusCode::NOT_FOUND,
                        props: missing,
                    },
                ]
            }
        }
    }

    pub(super) async fn handle_proppatch(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        let guard = self.confirm_locks(parts, Some(path), None).await?;
        let result = self.proppatch(path, body).await;
        guard.release();
        result
    }

    async fn proppatch(&self, path: &VirtualPath, body: Body) -> Result<Response, DavError> {
        let meta = self.resolver.resolve(path).await?;
        let body = read_xml_body(body).await?;
        let patches = parse_proppatch(&body)?;

        let mut propstats: Vec<PropStat> = Vec::new();
        for (name, status) in self.props.apply(path, &patches) {
            match propstats.iter_mut().find(|propstat| propstat.status == status) {
                Some(propstat) => propstat.props.push(name.empty()),
                None => propstats.push(PropStat {
                    status,
                    props: vec![name.empty()],
                }),
            }
        }
        let mut multistatus = MultiStatus::new();
        multistatus.push_propstats(&self.href(path, meta.is_folder()), &propstats);
        Ok(multi_status(multistatus.finish()))
    }
}
