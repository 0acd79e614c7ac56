//! WebDAV XML 请求体解析与多状态响应构造。

use axum::http::StatusCode;
use std::fmt::Write as _;
use xmltree::{Element, EmitterConfig, XMLNode};

pub const DAV_NS: &str = "DAV:";

/// Namespace-qualified property name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropName {
    pub ns: String,
    pub name: String,
}

impl PropName {
    pub fn dav(name: &str) -> Self {
        Self {
            ns: DAV_NS.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_dav(&self) -> bool {
        self.ns == DAV_NS
    }

    fn of(element: &Element) -> Self {
        Self {
            ns: element.namespace.clone().unwrap_or_default(),
            name: element.name.clone(),
        }
    }

    /// 带值的属性元素；`inner` 必须已是合法 XML。
    pub fn element(&self, inner: &str) -> String {
        if self.is_dav() {
            if inner.is_empty() {
                format!("<D:{}/>", self.name)
            } else {
                format!("<D:{0}>{1}</D:{0}>", self.name, inner)
            }
        } else if inner.is_empty() {
            format!("<{} xmlns=\"{}\"/>", self.name, escape(&self.ns))
        } else {
            format!("<{0} xmlns=\"{1}\">{2}</{0}>", self.name, escape(&self.ns), inner)
        }
    }

    pub fn empty(&self) -> String {
        self.element("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropfindRequest {
    AllProp,
    PropName,
    Prop(Vec<PropName>),
}

impl PropfindRequest {
    /// 请求体只询问配额属性。
    pub fn is_quota_query(&self) -> bool {
        matches!(self, PropfindRequest::Prop(names)
            if names.iter().any(|n| n.is_dav() && n.name == "quota-available-bytes"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropPatch {
    pub remove: bool,
    /// Property name and its inner XML value (empty for removals).
    pub props: Vec<(PropName, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub exclusive: bool,
    pub write: bool,
    pub owner_xml: String,
}

fn parse_root(body: &[u8], expected: &str) -> Result<Element, XmlError> {
    let root = Element::parse(body).map_err(|_| XmlError)?;
    if root.name != expected || root.namespace.as_deref() != Some(DAV_NS) {
        return Err(XmlError);
    }
    Ok(root)
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(XMLNode::as_element)
}

fn dav_child<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    child_elements(element).find(|child| child.name == name && child.namespace.as_deref() == Some(DAV_NS))
}

/// Empty bodies mean `allprop`.
pub fn parse_propfind(body: &[u8]) -> Result<PropfindRequest, XmlError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(PropfindRequest::AllProp);
    }
    let root = parse_root(body, "propfind")?;
    if dav_child(&root, "allprop").is_some() {
        return Ok(PropfindRequest::AllProp);
    }
    if dav_child(&root, "propname").is_some() {
        return Ok(PropfindRequest::PropName);
    }
    let prop = dav_child(&root, "prop").ok_or(XmlError)?;
    let names: Vec<PropName> = child_elements(prop).map(PropName::of).collect();
    if names.is_empty() {
        return Err(XmlError);
    }
    Ok(PropfindRequest::Prop(names))
}

pub fn parse_proppatch(body: &[u8]) -> Result<Vec<PropPatch>, XmlError> {
    let root = parse_root(body, "propertyupdate")?;
    let mut patches = Vec::new();
    for op in child_elements(&root) {
        if op.namespace.as_deref() != Some(DAV_NS) {
            continue;
        }
        let remove = match op.name.as_str() {
            "set" => false,
            "remove" => true,
            _ => continue,
        };
        let prop = dav_child(op, "prop").ok_or(XmlError)?;
        let props = child_elements(prop)
            .map(|element| {
                let value = if remove { String::new() } else { inner_xml(element) };
                (PropName::of(element), value)
            })
            .collect();
        patches.push(PropPatch { remove, props });
    }
    if patches.is_empty() {
        return Err(XmlError);
    }
    Ok(patches)
}

/// `None` for an empty body (a lock refresh).
pub fn parse_lockinfo(body: &[u8]) -> Result<Option<LockInfo>, XmlError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let root = parse_root(body, "lockinfo")?;
    let scope = dav_child(&root, "lockscope").ok_or(XmlError)?;
    let kind = dav_child(&root, "locktype").ok_or(XmlError)?;
    let exclusive = dav_child(scope, "exclusive").is_some();
    if !exclusive && dav_child(scope, "shared").is_none() {
        return Err(XmlError);
    }
    let write = dav_child(kind, "write").is_some();
    let owner_xml = dav_child(&root, "owner").map(inner_xml).unwrap_or_default();
    Ok(Some(LockInfo {
        exclusive,
        write,
        owner_xml,
    }))
}

/// 元素内容原样序列化（不含元素自身）。
pub fn inner_xml(element: &Element) -> String {
    let mut out = String::new();
    for node in &element.children {
        match node {
            XMLNode::Element(child) => {
                let mut buf = Vec::new();
                let config = EmitterConfig::new().write_document_declaration(false);
                if child.write_with_config(&mut buf, config).is_ok() {
                    out.push_str(&String::from_utf8_lossy(&buf));
                }
            }
            XMLNode::Text(text) | XMLNode::CData(text) => out.push_str(&escape(text)),
            _ => {}
        }
    }
    out
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
}

/// One `<D:propstat>` group of already serialized properties.
pub struct PropStat {
    pub status: StatusCode,
    pub props: Vec<String>,
}

/// 多状态响应体构造器。
pub struct MultiStatus {
    body: String,
}

impl Default for MultiStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiStatus {
    pub fn new() -> Self {
        Self {
            body: String::from(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><D:multistatus xmlns:D=\"DAV:\">",
            ),
        }
    }

    pub fn push_propstats(&mut self, href: &str, propstats: &[PropStat]) {
        let _ = write!(self.body, "<D:response><D:href>{}</D:href>", escape(href));
        for propstat in propstats.iter().filter(|p| !p.props.is_empty()) {
            self.body.push_str("<D:propstat><D:prop>");
            for prop in &propstat.props {
                self.body.push_str(prop);
            }
            let _ = write!(
                self.body,
                "</D:prop><D:status>{}</D:status></D:propstat>",
                status_line(propstat.status)
            );
        }
        self.body.push_str("</D:response>");
    }

    #[cfg(test)]
    pub fn push_status(&mut self, href: &str, status: StatusCode) {
        let _ = write!(
            self.body,
            "<D:response><D:href>{}</D:href><D:status>{}</D:status></D:response>",
            escape(href),
            status_line(status)
        );
    }

    pub fn finish(mut self) -> String {
        self.body.push_str("</D:multistatus>");
        self.body
    }
}

/// `<D:prop><D:lockdiscovery>…</D:lockdiscovery></D:prop>` LOCK 响应体。
pub fn lock_response(activelocks: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><D:prop xmlns:D=\"DAV:\">{}</D:prop>",
        PropName::dav("lockdiscovery").element(&activelocks.concat())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_propfind_is_allprop() {
        assert_eq!(parse_propfind(b""), Ok(PropfindRequest::AllProp));
        assert_eq!(parse_propfind(b"  \n"), Ok(PropfindRequest::AllProp));
    }

    #[test]
    fn propfind_prop_names_keep_namespaces() {
        let body = br#"<?xml version="1.0"?>
            <D:propfind xmlns:D="DAV:" xmlns:Z="urn:z">
              <D:prop><D:getetag/><Z:color/></D:prop>
            </D:propfind>"#;
        let PropfindRequest::Prop(names) = parse_propfind(body).expect("parse") else {
            panic!("expected prop mode");
        };
        assert_eq!(names[0], PropName::dav("getetag"));
        assert_eq!(names[1].ns, "urn:z");
        assert_eq!(names[1].name, "color");
    }

    #[test]
    fn quota_query_is_detected() {
        let body = br#"<propfind xmlns="DAV:"><prop><quota-available-bytes/><quota-used-bytes/></prop></propfind>"#;
        assert!(parse_propfind(body).expect("parse").is_quota_query());
        assert!(!PropfindRequest::AllProp.is_quota_query());
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert_eq!(parse_propfind(b"<propfind"), Err(XmlError));
        assert_eq!(parse_propfind(b"<other xmlns=\"DAV:\"/>"), Err(XmlError));
        assert_eq!(parse_proppatch(b"<propertyupdate xmlns=\"DAV:\"/>"), Err(XmlError));
    }

    #[test]
    fn proppatch_set_and_remove() {
        let body = br#"<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:z">
              <D:set><D:prop><Z:author>Ann &amp; Bo</Z:author></D:prop></D:set>
              <D:remove><D:prop><Z:old/></D:prop></D:remove>
            </D:propertyupdate>"#;
        let patches = parse_proppatch(body).expect("parse");
        assert_eq!(patches.len(), 2);
        assert!(!patches[0].remove);
        assert_eq!(patches[0].props[0].1, "Ann &amp; Bo");
        assert!(patches[1].remove);
        assert_eq!(patches[1].props[0].0.name, "old");
    }

    #[test]
    fn lockinfo_parsing() {
        assert_eq!(parse_lockinfo(b""), Ok(None));
        let body = br#"<D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:exclusive/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner>me</D:owner>
            </D:lockinfo>"#;
        let info = parse_lockinfo(body).expect("parse").expect("lock");
        assert!(info.exclusive && info.write);
        assert_eq!(info.owner_xml, "me");

        let shared = br#"<D:lockinfo xmlns:D="DAV:"><D:lockscope><D:shared/></D:lockscope><D:locktype><D:write/></D:locktype></D:lockinfo>"#;
        assert!(!parse_lockinfo(shared).expect("parse").expect("lock").exclusive);
    }

    #[test]
    fn multistatus_shape() {
        let mut ms = MultiStatus::new();
        ms.push_propstats(
            "/a&b",
            &[
                PropStat {
                    status: StatusCode::OK,
                    props: vec![PropName::dav("displayname").element("x")],
                },
                PropStat {
                    status: StatusCode::NOT_FOUND,
                    props: Vec::new(),
                },
            ],
        );
        ms.push_status("/gone", StatusCode::FORBIDDEN);
        let body = ms.finish();
        assert!(body.contains("<D:href>/a&amp;b</D:href>"));
        assert!(body.contains("<D:displayname>x</D:displayname>"));
        assert!(body.contains("HTTP/1.1 200 OK"));
        assert!(!body.contains("404"));
        assert!(body.contains("HTTP/1.1 403 Forbidden"));
        assert!(body.ends_with("</D:multistatus>"));
    }

    #[test]
    fn foreign_namespace_properties_declare_it() {
        let name = PropName {
            ns: "urn:z".into(),
            name: "color".into(),
        };
        assert_eq!(name.element("red"), "<color xmlns=\"urn:z\">red</color>");
        assert_eq!(PropName::dav("collection").empty(), "<D:collection/>");
    }
}
