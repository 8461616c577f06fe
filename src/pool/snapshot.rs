//! State snapshots: human-readable `inspect` text and the stable XML
//! representation.
//!
//! The snapshot structs are plain data built under the pool lock;
//! rendering and parsing happen without it. The XML schema is stable:
//! `<info version="2">` with `process_count`, `max`, `utilization`,
//! `get_wait_list_size`, an optional `get_wait_list`, and `supergroups`.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::pool::group::Group;
use crate::pool::process::Process;
use crate::pool::supergroup::SuperGroup;
use crate::pool::GetWaiter;

#[derive(Debug, Clone, Copy, Default)]
pub struct InspectOptions {
    pub colorize: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub process_count: usize,
    pub max: usize,
    pub utilization: usize,
    pub get_wait_list_size: usize,
    /// App group names of parked top-level waiters; only present when
    /// secrets are included.
    pub get_wait_list: Option<Vec<String>>,
    pub supergroups: Vec<SuperGroupSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperGroupSnapshot {
    pub name: String,
    pub state: String,
    pub get_wait_list_size: usize,
    pub utilization: usize,
    pub secret: Option<String>,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub default: bool,
    pub app_root: String,
    pub app_type: String,
    pub environment: String,
    pub enabled_process_count: usize,
    pub disabling_process_count: usize,
    pub disabled_process_count: usize,
    pub utilization: usize,
    pub get_wait_list_size: usize,
    pub disable_wait_list_size: usize,
    pub spawning: bool,
    pub restarting: bool,
    pub secret: Option<String>,
    pub life_status: String,
    pub processes: Vec<ProcessSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: i32,
    pub gupid: String,
    pub connect_password: String,
    pub concurrency: u32,
    pub sessions: u32,
    pub utilization: u64,
    pub processed: u64,
    pub spawner_creation_time: u64,
    pub spawn_start_time: u64,
    pub spawn_end_time: u64,
    pub last_used: u64,
    pub life_status: String,
    pub enabled: String,
    pub sockets: Vec<SocketSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSnapshot {
    pub name: String,
    pub address: String,
    pub protocol: String,
    pub concurrency: u32,
    pub sessions: u32,
}

// ----- building ----------------------------------------------------------

pub(crate) fn snapshot_pool(
    supergroups: &BTreeMap<String, SuperGroup>,
    get_waitlist: &VecDeque<GetWaiter>,
    max: usize,
    utilization: usize,
    process_count: usize,
    include_secrets: bool,
) -> PoolSnapshot {
    PoolSnapshot {
        process_count,
        max,
        utilization,
        get_wait_list_size: get_waitlist.len(),
        get_wait_list: include_secrets.then(|| {
            get_waitlist
                .iter()
                .map(|waiter| waiter.options.app_group_name().to_string())
                .collect()
        }),
        supergroups: supergroups
            .values()
            .map(|sg| snapshot_supergroup(sg, include_secrets))
            .collect(),
    }
}

fn snapshot_supergroup(sg: &SuperGroup, include_secrets: bool) -> SuperGroupSnapshot {
    SuperGroupSnapshot {
        name: sg.name.clone(),
        state: sg.state.as_str().to_string(),
        get_wait_list_size: sg.get_waitlist_size(),
        utilization: sg.utilization(),
        secret: include_secrets.then(|| sg.secret.clone()),
        groups: sg
            .groups
            .iter()
            .enumerate()
            .map(|(index, group)| snapshot_group(group, index == 0, include_secrets))
            .collect(),
    }
}

pub(crate) fn snapshot_group(group: &Group, default: bool, include_secrets: bool) -> GroupSnapshot {
    GroupSnapshot {
        name: group.name.clone(),
        default,
        app_root: group.options.app_root.clone(),
        app_type: group.options.app_type.clone(),
        environment: group.options.environment.clone(),
        enabled_process_count: group.enabled_count(),
        disabling_process_count: group.disabling_count(),
        disabled_process_count: group.disabled_count(),
        utilization: group.utilization(),
        get_wait_list_size: group.get_waitlist_size(),
        disable_wait_list_size: group.disable_waitlist_size(),
        spawning: group.spawning(),
        restarting: group.restarting(),
        secret: include_secrets.then(|| group.secret.clone()),
        life_status: group.life().as_str().to_string(),
        processes: group
            .enabled
            .iter()
            .chain(group.disabling.iter())
            .chain(group.disabled.iter())
            .chain(group.detached.iter())
            .map(snapshot_process)
            .collect(),
    }
}

fn snapshot_process(process: &Process) -> ProcessSnapshot {
    ProcessSnapshot {
        pid: process.pid,
        gupid: process.gupid.clone(),
        connect_password: process.connect_password.clone(),
        concurrency: process.concurrency,
        sessions: process.sessions,
        utilization: process.utilization(),
        processed: process.processed,
        spawner_creation_time: process.spawner_creation_time,
        spawn_start_time: process.spawn_start_time,
        spawn_end_time: process.spawn_end_time,
        last_used: process.last_used,
        life_status: process.life_status().as_str().to_string(),
        enabled: process.enabled.as_str().to_string(),
        sockets: process
            .sockets
            .iter()
            .map(|socket| SocketSnapshot {
                name: socket.name.clone(),
                address: socket.address.to_string(),
                protocol: socket.protocol.as_str().to_string(),
                concurrency: socket.concurrency,
                sessions: socket.sessions,
            })
            .collect(),
    }
}

// ----- inspect text ------------------------------------------------------

const ANSI_HEADER: &str = "\x1b[33;44;1m";
const ANSI_RESET: &str = "\x1b[0m";

pub fn render_inspect(snapshot: &PoolSnapshot, options: &InspectOptions) -> String {
    let (header, reset) = if options.colorize {
        (ANSI_HEADER, ANSI_RESET)
    } else {
        ("", "")
    };
    let mut out = String::new();
    let _ = writeln!(out, "{header}----------- General information -----------{reset}");
    let _ = writeln!(out, "Max pool size : {}", snapshot.max);
    let _ = writeln!(out, "Processes     : {}", snapshot.process_count);
    let _ = writeln!(
        out,
        "Requests in top-level queue : {}",
        snapshot.get_wait_list_size
    );
    if options.verbose {
        if let Some(waiters) = &snapshot.get_wait_list {
            for (index, name) in waiters.iter().enumerate() {
                let _ = writeln!(out, "  {index}: {name}");
            }
        }
    }
    out.push('\n');

    let _ = writeln!(out, "{header}----------- Application groups -----------{reset}");
    for sg in &snapshot.supergroups {
        for group in &sg.groups {
            let _ = writeln!(out, "{}:", group.name);
            let _ = writeln!(out, "  App root: {}", group.app_root);
            if group.restarting {
                let _ = writeln!(out, "  (restarting...)");
            }
            if group.spawning {
                let _ = writeln!(out, "  (spawning new process...)");
            }
            let _ = writeln!(out, "  Requests in queue: {}", group.get_wait_list_size);
            for process in &group.processes {
                let _ = writeln!(
                    out,
                    "  * PID: {:<5}   Sessions: {:<2}   Processed: {:<5}   Enabled: {}",
                    process.pid, process.sessions, process.processed, process.enabled
                );
                if options.verbose {
                    for socket in &process.sockets {
                        let _ = writeln!(
                            out,
                            "    Socket: {} {} ({}; concurrency {})",
                            socket.name, socket.address, socket.protocol, socket.concurrency
                        );
                    }
                    let _ = writeln!(out, "    Password: {}", process.connect_password);
                }
            }
            out.push('\n');
        }
    }
    out
}

// ----- XML ---------------------------------------------------------------

pub fn render_xml(snapshot: &PoolSnapshot) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<info version=\"2\">");
    element(&mut out, "process_count", &snapshot.process_count.to_string());
    element(&mut out, "max", &snapshot.max.to_string());
    element(&mut out, "utilization", &snapshot.utilization.to_string());
    element(
        &mut out,
        "get_wait_list_size",
        &snapshot.get_wait_list_size.to_string(),
    );
    if let Some(waiters) = &snapshot.get_wait_list {
        out.push_str("<get_wait_list>");
        for name in waiters {
            out.push_str("<item>");
            element(&mut out, "app_group_name", name);
            out.push_str("</item>");
        }
        out.push_str("</get_wait_list>");
    }
    out.push_str("<supergroups>");
    for sg in &snapshot.supergroups {
        out.push_str("<supergroup>");
        element(&mut out, "name", &sg.name);
        element(&mut out, "state", &sg.state);
        element(
            &mut out,
            "get_wait_list_size",
            &sg.get_wait_list_size.to_string(),
        );
        element(&mut out, "utilization", &sg.utilization.to_string());
        if let Some(secret) = &sg.secret {
            element(&mut out, "secret", secret);
        }
        for group in &sg.groups {
            if group.default {
                out.push_str("<group default=\"true\">");
            } else {
                out.push_str("<group>");
            }
            render_group_xml(&mut out, group);
            out.push_str("</group>");
        }
        out.push_str("</supergroup>");
    }
    out.push_str("</supergroups>");
    out.push_str("</info>");
    out
}

fn render_group_xml(out: &mut String, group: &GroupSnapshot) {
    element(out, "name", &group.name);
    element(out, "app_root", &group.app_root);
    element(out, "app_type", &group.app_type);
    element(out, "environment", &group.environment);
    element(
        out,
        "enabled_process_count",
        &group.enabled_process_count.to_string(),
    );
    element(
        out,
        "disabling_process_count",
        &group.disabling_process_count.to_string(),
    );
    element(
        out,
        "disabled_process_count",
        &group.disabled_process_count.to_string(),
    );
    element(out, "utilization", &group.utilization.to_string());
    element(
        out,
        "get_wait_list_size",
        &group.get_wait_list_size.to_string(),
    );
    element(
        out,
        "disable_wait_list_size",
        &group.disable_wait_list_size.to_string(),
    );
    if group.spawning {
        out.push_str("<spawning/>");
    }
    if group.restarting {
        out.push_str("<restarting/>");
    }
    if let Some(secret) = &group.secret {
        element(out, "secret", secret);
    }
    element(out, "life_status", &group.life_status);
    out.push_str("<processes>");
    for process in &group.processes {
        out.push_str("<process>");
        element(out, "pid", &process.pid.to_string());
        element(out, "gupid", &process.gupid);
        element(out, "connect_password", &process.connect_password);
        element(out, "concurrency", &process.concurrency.to_string());
        element(out, "sessions", &process.sessions.to_string());
        element(out, "utilization", &process.utilization.to_string());
        element(out, "processed", &process.processed.to_string());
        element(
            out,
            "spawner_creation_time",
            &process.spawner_creation_time.to_string(),
        );
        element(
            out,
            "spawn_start_time",
            &process.spawn_start_time.to_string(),
        );
        element(out, "spawn_end_time", &process.spawn_end_time.to_string());
        element(out, "last_used", &process.last_used.to_string());
        element(out, "life_status", &process.life_status);
        element(out, "enabled", &process.enabled);
        out.push_str("<sockets>");
        for socket in &process.sockets {
            out.push_str("<socket>");
            element(out, "name", &socket.name);
            element(out, "address", &socket.address);
            element(out, "protocol", &socket.protocol);
            element(out, "concurrency", &socket.concurrency.to_string());
            element(out, "sessions", &socket.sessions.to_string());
            out.push_str("</socket>");
        }
        out.push_str("</sockets>");
        out.push_str("</process>");
    }
    out.push_str("</processes>");
}

/// `<group>` fragment for per-group analytics publishing.
pub(crate) fn render_group_fragment(group: &Group) -> String {
    let snapshot = snapshot_group(group, true, false);
    let mut out = String::new();
    out.push_str("<group>");
    render_group_xml(&mut out, &snapshot);
    out.push_str("</group>");
    out
}

fn element(out: &mut String, name: &str, text: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
    out.push_str(&escape_xml(text));
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ----- XML parsing -------------------------------------------------------
//
// A minimal reader for the fixed schema above, enough for round-trip
// checks and for control planes that read our own snapshots back. Not a
// general XML parser.

#[derive(Debug, Clone)]
struct XmlElement {
    name: String,
    attrs: String,
    inner: String,
}

impl XmlElement {
    fn has_attr_flag(&self, key: &str, value: &str) -> bool {
        self.attrs.contains(&format!("{key}=\"{value}\""))
    }
}

/// Split a run of sibling elements. Nesting-aware for same-named tags.
fn children(mut input: &str) -> Vec<XmlElement> {
    let mut out = Vec::new();
    loop {
        input = input.trim_start();
        let Some(rest) = input.strip_prefix('<') else {
            return out;
        };
        let Some(close) = rest.find('>') else {
            return out;
        };
        let tag = &rest[..close];
        if let Some(tag) = tag.strip_suffix('/') {
            let (name, attrs) = split_tag(tag);
            out.push(XmlElement {
                name,
                attrs,
                inner: String::new(),
            });
            input = &rest[close + 1..];
            continue;
        }
        let (name, attrs) = split_tag(tag);
        let body = &rest[close + 1..];
        let Some((inner, after)) = find_matching_close(body, &name) else {
            return out;
        };
        out.push(XmlElement {
            name,
            attrs,
            inner: inner.to_string(),
        });
        input = after;
    }
}

fn split_tag(tag: &str) -> (String, String) {
    match tag.split_once(' ') {
        Some((name, attrs)) => (name.to_string(), attrs.to_string()),
        None => (tag.to_string(), String::new()),
    }
}

fn find_matching_close<'a>(body: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut depth = 1usize;
    let mut pos = 0usize;
    while depth > 0 {
        let next_close = body[pos..].find(&close)?;
        let next_open = body[pos..].find(&open).filter(|&o| {
            // An opening tag must be followed by '>', ' ' or '/'.
            body[pos + o + open.len()..]
                .chars()
                .next()
                .is_some_and(|c| c == '>' || c == ' ' || c == '/')
        });
        match next_open {
            Some(next_open) if next_open < next_close => {
                depth += 1;
                pos += next_open + open.len();
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    let inner_end = pos + next_close;
                    return Some((&body[..inner_end], &body[inner_end + close.len()..]));
                }
                pos += next_close + close.len();
            }
        }
    }
    None
}

fn child_text(elements: &[XmlElement], name: &str) -> Option<String> {
    elements
        .iter()
        .find(|e| e.name == name)
        .map(|e| unescape_xml(e.inner.trim()))
}

fn child_parse<T: std::str::FromStr>(elements: &[XmlElement], name: &str) -> Option<T> {
    child_text(elements, name)?.parse().ok()
}

/// Parse a snapshot rendered by [`render_xml`].
pub fn parse_xml(input: &str) -> Option<PoolSnapshot> {
    let input = match input.find("?>") {
        Some(pos) => &input[pos + 2..],
        None => input,
    };
    let info = children(input).into_iter().find(|e| e.name == "info")?;
    let fields = children(&info.inner);

    let get_wait_list = fields
        .iter()
        .find(|e| e.name == "get_wait_list")
        .map(|list| {
            children(&list.inner)
                .iter()
                .filter(|e| e.name == "item")
                .filter_map(|item| child_text(&children(&item.inner), "app_group_name"))
                .collect()
        });

    let supergroups = fields
        .iter()
        .find(|e| e.name == "supergroups")
        .map(|wrapper| {
            children(&wrapper.inner)
                .iter()
                .filter(|e| e.name == "supergroup")
                .filter_map(parse_supergroup)
                .collect()
        })
        .unwrap_or_default();

    Some(PoolSnapshot {
        process_count: child_parse(&fields, "process_count")?,
        max: child_parse(&fields, "max")?,
        utilization: child_parse(&fields, "utilization")?,
        get_wait_list_size: child_parse(&fields, "get_wait_list_size")?,
        get_wait_list,
        supergroups,
    })
}

fn parse_supergroup(element: &XmlElement) -> Option<SuperGroupSnapshot> {
    let fields = children(&element.inner);
    Some(SuperGroupSnapshot {
        name: child_text(&fields, "name")?,
        state: child_text(&fields, "state")?,
        get_wait_list_size: child_parse(&fields, "get_wait_list_size")?,
        utilization: child_parse(&fields, "utilization")?,
        secret: child_text(&fields, "secret"),
        groups: fields
            .iter()
            .filter(|e| e.name == "group")
            .filter_map(parse_group)
            .collect(),
    })
}

fn parse_group(element: &XmlElement) -> Option<GroupSnapshot> {
    let fields = children(&element.inner);
    Some(GroupSnapshot {
        name: child_text(&fields, "name")?,
        default: element.has_attr_flag("default", "true"),
        app_root: child_text(&fields, "app_root")?,
        app_type: child_text(&fields, "app_type").unwrap_or_default(),
        environment: child_text(&fields, "environment")?,
        enabled_process_count: child_parse(&fields, "enabled_process_count")?,
        disabling_process_count: child_parse(&fields, "disabling_process_count")?,
        disabled_process_count: child_parse(&fields, "disabled_process_count")?,
        utilization: child_parse(&fields, "utilization")?,
        get_wait_list_size: child_parse(&fields, "get_wait_list_size")?,
        disable_wait_list_size: child_parse(&fields, "disable_wait_list_size")?,
        spawning: fields.iter().any(|e| e.name == "spawning"),
        restarting: fields.iter().any(|e| e.name == "restarting"),
        secret: child_text(&fields, "secret"),
        life_status: child_text(&fields, "life_status")?,
        processes: fields
            .iter()
            .find(|e| e.name == "processes")
            .map(|wrapper| {
                children(&wrapper.inner)
                    .iter()
                    .filter(|e| e.name == "process")
                    .filter_map(parse_process)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn parse_process(element: &XmlElement) -> Option<ProcessSnapshot> {
    let fields = children(&element.inner);
    Some(ProcessSnapshot {
        pid: child_parse(&fields, "pid")?,
        gupid: child_text(&fields, "gupid")?,
        connect_password: child_text(&fields, "connect_password")?,
        concurrency: child_parse(&fields, "concurrency")?,
        sessions: child_parse(&fields, "sessions")?,
        utilization: child_parse(&fields, "utilization")?,
        processed: child_parse(&fields, "processed")?,
        spawner_creation_time: child_parse(&fields, "spawner_creation_time")?,
        spawn_start_time: child_parse(&fields, "spawn_start_time")?,
        spawn_end_time: child_parse(&fields, "spawn_end_time")?,
        last_used: child_parse(&fields, "last_used")?,
        life_status: child_text(&fields, "life_status")?,
        enabled: child_text(&fields, "enabled")?,
        sockets: fields
            .iter()
            .find(|e| e.name == "sockets")
            .map(|wrapper| {
                children(&wrapper.inner)
                    .iter()
                    .filter(|e| e.name == "socket")
                    .filter_map(parse_socket)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn parse_socket(element: &XmlElement) -> Option<SocketSnapshot> {
    let fields = children(&element.inner);
    Some(SocketSnapshot {
        name: child_text(&fields, "name")?,
        address: child_text(&fields, "address")?,
        protocol: child_text(&fields, "protocol")?,
        concurrency: child_parse(&fields, "concurrency")?,
        sessions: child_parse(&fields, "sessions")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> PoolSnapshot {
        PoolSnapshot {
            process_count: 2,
            max: 6,
            utilization: 2,
            get_wait_list_size: 1,
            get_wait_list: Some(vec!["/srv/other".to_string()]),
            supergroups: vec![SuperGroupSnapshot {
                name: "/srv/app & co".to_string(),
                state: "ready".to_string(),
                get_wait_list_size: 0,
                utilization: 2,
                secret: Some("s3cret<>&".to_string()),
                groups: vec![GroupSnapshot {
                    name: "/srv/app & co#default".to_string(),
                    default: true,
                    app_root: "/srv/app".to_string(),
                    app_type: "rack".to_string(),
                    environment: "production".to_string(),
                    enabled_process_count: 2,
                    disabling_process_count: 0,
                    disabled_process_count: 0,
                    utilization: 2,
                    get_wait_list_size: 0,
                    disable_wait_list_size: 0,
                    spawning: true,
                    restarting: false,
                    secret: Some("group-secret".to_string()),
                    life_status: "alive".to_string(),
                    processes: vec![ProcessSnapshot {
                        pid: 4321,
                        gupid: "17ab-XyZ".to_string(),
                        connect_password: "pw".to_string(),
                        concurrency: 4,
                        sessions: 2,
                        utilization: 1073741823,
                        processed: 17,
                        spawner_creation_time: 1,
                        spawn_start_time: 2,
                        spawn_end_time: 3,
                        last_used: 4,
                        life_status: "alive".to_string(),
                        enabled: "enabled".to_string(),
                        sockets: vec![SocketSnapshot {
                            name: "main".to_string(),
                            address: "unix:/run/app.sock".to_string(),
                            protocol: "session".to_string(),
                            concurrency: 4,
                            sessions: 2,
                        }],
                    }],
                }],
            }],
        }
    }

    #[test]
    fn xml_round_trip_preserves_everything() {
        let snapshot = sample_snapshot();
        let xml = render_xml(&snapshot);
        let parsed = parse_xml(&xml).expect("own output parses");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn xml_without_secrets_omits_them() {
        let mut snapshot = sample_snapshot();
        snapshot.get_wait_list = None;
        snapshot.supergroups[0].secret = None;
        snapshot.supergroups[0].groups[0].secret = None;
        let xml = render_xml(&snapshot);
        assert!(!xml.contains("<secret>"));
        assert!(!xml.contains("<get_wait_list>"));
        let parsed = parse_xml(&xml).expect("parses");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn escaping_round_trips() {
        assert_eq!(unescape_xml(&escape_xml("a<b>&\"'c")), "a<b>&\"'c");
        // The group name with markup characters survives.
        let snapshot = sample_snapshot();
        let xml = render_xml(&snapshot);
        assert!(xml.contains("&amp; co"));
    }

    #[test]
    fn inspect_renders_headline_counts() {
        let snapshot = sample_snapshot();
        let text = render_inspect(&snapshot, &InspectOptions::default());
        assert!(text.contains("Max pool size : 6"));
        assert!(text.contains("Processes     : 2"));
        assert!(text.contains("Requests in top-level queue : 1"));
        assert!(text.contains("/srv/app & co#default:"));
        assert!(text.contains("(spawning new process...)"));
        assert!(!text.contains("\x1b["), "no color without colorize");

        let verbose = render_inspect(
            &snapshot,
            &InspectOptions {
                colorize: true,
                verbose: true,
            },
        );
        assert!(verbose.contains("\x1b["));
        assert!(verbose.contains("Password: pw"));
        assert!(verbose.contains("0: /srv/other"));
    }

    #[test]
    fn nested_same_name_elements_parse() {
        // `name` appears at several levels; make sure matching is not
        // fooled.
        let xml = render_xml(&sample_snapshot());
        let parsed = parse_xml(&xml).unwrap();
        assert_eq!(parsed.supergroups[0].name, "/srv/app & co");
        assert_eq!(parsed.supergroups[0].groups[0].name, "/srv/app & co#default");
        assert_eq!(
            parsed.supergroups[0].groups[0].processes[0].sockets[0].name,
            "main"
        );
    }
}
