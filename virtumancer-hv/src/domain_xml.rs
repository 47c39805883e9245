//! Domain XML parsing, canonicalization and rendering.
//!
//! Live XML is reduced to a [`DomainSpec`] whose fields compare equal whenever two
//! definitions describe the same hardware. Normalization rules:
//!
//! * memory is converted to bytes; `<vcpu>` text is the vCPU count.
//! * `cpu_model` is `<cpu><model>` text, or the `<cpu mode>` for host-passthrough /
//!   host-model CPUs.
//! * every device element is flattened into `path@attr` / `path` (text) keys;
//!   repeated siblings get `[i]` suffixes, values are trimmed and empty values dropped.
//! * runtime-only data is elided: `<alias>`, device-level `<address>`, interface
//!   `target@dev`, pty `source@path`, graphics ports with `autoport='yes'`,
//!   `<backenddomain>`.
//! * childless elements without attributes (`<readonly/>`) are kept as empty values.
//! * implicit defaults are elided: disk `@type=file`, disk `@device=disk`,
//!   input `@bus=ps2`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed domain XML: {0}")]
    Syntax(#[from] roxmltree::Error),

    #[error("domain XML is missing <{0}>")]
    Missing(&'static str),

    #[error("invalid value for <{field}>: {value}")]
    Invalid { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

/// Device element families tracked by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Interface,
    Console,
    Controller,
    Input,
    Sound,
    Hostdev,
    Tpm,
    Watchdog,
    Serial,
    Channel,
    Filesystem,
    Smartcard,
    Redirdev,
    Rng,
    Panic,
    Vsock,
    Memballoon,
    Shmem,
    Iommu,
    Graphics,
    Video,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 22] = [
        DeviceKind::Disk,
        DeviceKind::Interface,
        DeviceKind::Console,
        DeviceKind::Controller,
        DeviceKind::Input,
        DeviceKind::Sound,
        DeviceKind::Hostdev,
        DeviceKind::Tpm,
        DeviceKind::Watchdog,
        DeviceKind::Serial,
        DeviceKind::Channel,
        DeviceKind::Filesystem,
        DeviceKind::Smartcard,
        DeviceKind::Redirdev,
        DeviceKind::Rng,
        DeviceKind::Panic,
        DeviceKind::Vsock,
        DeviceKind::Memballoon,
        DeviceKind::Shmem,
        DeviceKind::Iommu,
        DeviceKind::Graphics,
        DeviceKind::Video,
    ];

    /// XML element name.
    pub fn tag(self) -> &'static str {
        match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Interface => "interface",
            DeviceKind::Console => "console",
            DeviceKind::Controller => "controller",
            DeviceKind::Input => "input",
            DeviceKind::Sound => "sound",
            DeviceKind::Hostdev => "hostdev",
            DeviceKind::Tpm => "tpm",
            DeviceKind::Watchdog => "watchdog",
            DeviceKind::Serial => "serial",
            DeviceKind::Channel => "channel",
            DeviceKind::Filesystem => "filesystem",
            DeviceKind::Smartcard => "smartcard",
            DeviceKind::Redirdev => "redirdev",
            DeviceKind::Rng => "rng",
            DeviceKind::Panic => "panic",
            DeviceKind::Vsock => "vsock",
            DeviceKind::Memballoon => "memballoon",
            DeviceKind::Shmem => "shmem",
            DeviceKind::Iommu => "iommu",
            DeviceKind::Graphics => "graphics",
            DeviceKind::Video => "video",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        DeviceKind::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Device record type the attachment points at. Disks attach volumes and
    /// interfaces attach ports; every other kind is its own device type.
    pub fn device_type(self) -> &'static str {
        match self {
            DeviceKind::Disk => "volume",
            DeviceKind::Interface => "port",
            other => other.tag(),
        }
    }

    /// Whether one device record may back attachments of several VMs.
    pub fn is_shareable(self) -> bool {
        matches!(self, DeviceKind::Disk)
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One canonicalized device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    /// Stable identity within `kind` (disk target, MAC, controller type:index, ...).
    pub key: String,
    pub attrs: BTreeMap<String, String>,
}

impl Device {
    /// Identity of the shared volume behind a disk.
    pub fn volume_source(&self) -> Option<&str> {
        if self.kind != DeviceKind::Disk {
            return None;
        }
        ["source@file", "source@dev", "source@name", "source@volume"]
            .iter()
            .find_map(|k| self.attrs.get(*k))
            .map(String::as_str)
    }
}

/// Canonical hardware description of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: String,
    pub vcpu_count: u32,
    pub memory_bytes: u64,
    pub cpu_model: Option<String>,
    pub cpu_topology: Option<CpuTopology>,
    pub os_type: String,
    pub devices: Vec<Device>,
}

impl DomainSpec {
    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(move |d| d.kind == kind)
    }
}

/// Device names usable for block/interface statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatTargets {
    pub disks: Vec<String>,
    pub interfaces: Vec<String>,
}

pub fn parse(xml: &str) -> Result<DomainSpec, XmlError> {
    let doc = roxmltree::Document::parse(xml)?;
    let domain = doc.root_element();
    if !domain.has_tag_name("domain") {
        return Err(XmlError::Missing("domain"));
    }

    let name = child_text(domain, "name")
        .ok_or(XmlError::Missing("name"))?
        .to_string();
    let uuid = child_text(domain, "uuid")
        .ok_or(XmlError::Missing("uuid"))?
        .to_lowercase();

    let vcpu_text = child_text(domain, "vcpu").ok_or(XmlError::Missing("vcpu"))?;
    let vcpu_count = vcpu_text.parse::<u32>().map_err(|_| XmlError::Invalid {
        field: "vcpu",
        value: vcpu_text.to_string(),
    })?;

    let memory = child(domain, "memory").ok_or(XmlError::Missing("memory"))?;
    let memory_text = memory.text().map(str::trim).unwrap_or_default();
    let amount = memory_text.parse::<u64>().map_err(|_| XmlError::Invalid {
        field: "memory",
        value: memory_text.to_string(),
    })?;
    let unit = memory.attribute("unit").unwrap_or("KiB");
    let memory_bytes = amount
        .checked_mul(unit_multiplier(unit).ok_or(XmlError::Invalid {
            field: "memory",
            value: unit.to_string(),
        })?)
        .ok_or(XmlError::Invalid {
            field: "memory",
            value: memory_text.to_string(),
        })?;

    let (cpu_model, cpu_topology) = match child(domain, "cpu") {
        Some(cpu) => parse_cpu(cpu)?,
        None => (None, None),
    };

    let os_type = child(domain, "os")
        .and_then(|os| child_text(os, "type"))
        .unwrap_or("hvm")
        .to_string();

    let mut devices = Vec::new();
    if let Some(devs) = child(domain, "devices") {
        let mut ordinals: BTreeMap<DeviceKind, usize> = BTreeMap::new();
        for el in devs.children().filter(|n| n.is_element()) {
            let Some(kind) = DeviceKind::from_tag(el.tag_name().name()) else {
                continue;
            };
            let ordinal = ordinals.entry(kind).or_default();
            let attrs = flatten_device(kind, el);
            let key = device_key(kind, &attrs, *ordinal);
            *ordinal += 1;
            devices.push(Device { kind, key, attrs });
        }
    }

    Ok(DomainSpec {
        name,
        uuid,
        vcpu_count,
        memory_bytes,
        cpu_model,
        cpu_topology,
        os_type,
        devices,
    })
}

/// Disk targets and interface names for stats calls. Unlike [`parse`] this keeps
/// runtime names such as `vnet3`, falling back to the MAC address.
pub fn stat_targets(xml: &str) -> Result<StatTargets, XmlError> {
    let doc = roxmltree::Document::parse(xml)?;
    let mut targets = StatTargets::default();
    let Some(devs) = child(doc.root_element(), "devices") else {
        return Ok(targets);
    };

    for el in devs.children().filter(|n| n.is_element()) {
        match el.tag_name().name() {
            "disk" => {
                if let Some(dev) = child(el, "target").and_then(|t| t.attribute("dev")) {
                    targets.disks.push(dev.to_string());
                }
            }
            "interface" => {
                let name = child(el, "target")
                    .and_then(|t| t.attribute("dev"))
                    .or_else(|| child(el, "mac").and_then(|m| m.attribute("address")));
                if let Some(name) = name {
                    targets.interfaces.push(name.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(targets)
}

/// The `<domain type=...>` attribute (`kvm`, `qemu`, `test`, ...).
pub fn domain_type(xml: &str) -> Result<String, XmlError> {
    let doc = roxmltree::Document::parse(xml)?;
    doc.root_element()
        .attribute("type")
        .map(str::to_string)
        .ok_or(XmlError::Missing("domain type"))
}

/// Render a minimal domain definition that parses back to `spec`.
pub fn render(spec: &DomainSpec, domain_type: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "<domain type='{}'>", escape(domain_type));
    let _ = writeln!(out, "  <name>{}</name>", escape(&spec.name));
    let _ = writeln!(out, "  <uuid>{}</uuid>", escape(&spec.uuid));
    if spec.memory_bytes % 1024 == 0 {
        let _ = writeln!(out, "  <memory unit='KiB'>{}</memory>", spec.memory_bytes / 1024);
    } else {
        let _ = writeln!(out, "  <memory unit='b'>{}</memory>", spec.memory_bytes);
    }
    let _ = writeln!(out, "  <vcpu>{}</vcpu>", spec.vcpu_count);
    let _ = writeln!(out, "  <os>\n    <type>{}</type>\n  </os>", escape(&spec.os_type));

    match (&spec.cpu_model, &spec.cpu_topology) {
        (None, None) => {}
        (model, topology) => {
            let host_mode = model
                .as_deref()
                .filter(|m| *m == "host-passthrough" || *m == "host-model");
            match host_mode {
                Some(mode) => {
                    let _ = write!(out, "  <cpu mode='{}'>", mode);
                }
                None => out.push_str("  <cpu mode='custom'>"),
            }
            if let Some(model) = model.as_deref().filter(|_| host_mode.is_none()) {
                let _ = write!(out, "<model>{}</model>", escape(model));
            }
            if let Some(t) = topology {
                let _ = write!(
                    out,
                    "<topology sockets='{}' cores='{}' threads='{}'/>",
                    t.sockets, t.cores, t.threads
                );
            }
            out.push_str("</cpu>\n");
        }
    }

    out.push_str("  <devices>\n");
    for device in &spec.devices {
        let tree = unflatten(&device.attrs);
        out.push_str("    ");
        write_element(&mut out, device.kind.tag(), &tree);
        out.push('\n');
    }
    out.push_str("  </devices>\n</domain>\n");
    out
}

fn parse_cpu(
    cpu: roxmltree::Node<'_, '_>,
) -> Result<(Option<String>, Option<CpuTopology>), XmlError> {
    let model = child_text(cpu, "model")
        .map(str::to_string)
        .or_else(|| {
            cpu.attribute("mode")
                .filter(|m| *m == "host-passthrough" || *m == "host-model")
                .map(str::to_string)
        });

    let topology = match child(cpu, "topology") {
        Some(t) => {
            let field = |name: &'static str| -> Result<u32, XmlError> {
                let raw = t.attribute(name).unwrap_or("1");
                raw.parse().map_err(|_| XmlError::Invalid {
                    field: "cpu/topology",
                    value: raw.to_string(),
                })
            };
            Some(CpuTopology {
                sockets: field("sockets")?,
                cores: field("cores")?,
                threads: field("threads")?,
            })
        }
        None => None,
    };

    Ok((model, topology))
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    Some(match unit {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "TB" => 1_000_000_000_000,
        "T" | "TiB" => 1 << 40,
        _ => return None,
    })
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn flatten_device(kind: DeviceKind, el: roxmltree::Node<'_, '_>) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    flatten_into(el, "", true, &mut attrs);

    // Runtime-only values.
    match kind {
        DeviceKind::Interface => {
            attrs.remove("target@dev");
        }
        DeviceKind::Console | DeviceKind::Serial
            if attrs.get("@type").map(String::as_str) == Some("pty") =>
        {
            attrs.remove("source@path");
            attrs.remove("@tty");
        }
        DeviceKind::Graphics if attrs.get("@autoport").map(String::as_str) == Some("yes") => {
            attrs.remove("@port");
            attrs.remove("@websocket");
            attrs.remove("@tlsPort");
        }
        _ => {}
    }

    // Implicit defaults.
    let defaults: &[(&str, &str)] = match kind {
        DeviceKind::Disk => &[("@type", "file"), ("@device", "disk")],
        DeviceKind::Input => &[("@bus", "ps2")],
        _ => &[],
    };
    for (key, value) in defaults {
        if attrs.get(*key).map(String::as_str) == Some(*value) {
            attrs.remove(*key);
        }
    }

    if let Some(mac) = attrs.get_mut("mac@address") {
        *mac = mac.to_lowercase();
    }

    attrs
}

fn flatten_into(
    el: roxmltree::Node<'_, '_>,
    path: &str,
    is_device_root: bool,
    out: &mut BTreeMap<String, String>,
) {
    for attr in el.attributes() {
        let value = attr.value().trim();
        if !value.is_empty() {
            out.insert(format!("{}@{}", path, attr.name()), value.to_string());
        }
    }

    let text: String = el
        .children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>();
    let text = text.trim();
    if !text.is_empty() {
        let key = if path.is_empty() { "." } else { path };
        out.insert(key.to_string(), text.to_string());
    }

    let elements: Vec<_> = el
        .children()
        .filter(|n| n.is_element())
        .filter(|n| !is_volatile(n.tag_name().name(), is_device_root))
        .collect();

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for c in &elements {
        let name = c.tag_name().name();
        let repeated = elements
            .iter()
            .filter(|o| o.tag_name().name() == name)
            .count()
            > 1;
        let index = seen.entry(name).or_default();
        let segment = if repeated {
            format!("{}[{}]", name, index)
        } else {
            name.to_string()
        };
        *index += 1;

        let child_path = if path.is_empty() {
            segment
        } else {
            format!("{}/{}", path, segment)
        };
        flatten_into(*c, &child_path, false, out);
    }

    // Flag elements such as <readonly/> carry meaning by presence alone.
    let has_attrs = el.attributes().any(|a| !a.value().trim().is_empty());
    if !is_device_root && !has_attrs && text.is_empty() && elements.is_empty() {
        out.insert(path.to_string(), String::new());
    }
}

fn is_volatile(tag: &str, is_device_root: bool) -> bool {
    match tag {
        "alias" | "backenddomain" => true,
        // Only the device's own bus address; <source><address> on hostdevs is identity.
        "address" => is_device_root,
        _ => false,
    }
}

fn device_key(kind: DeviceKind, attrs: &BTreeMap<String, String>, ordinal: usize) -> String {
    let get = |k: &str| attrs.get(k).map(String::as_str);
    let keyed = match kind {
        DeviceKind::Disk => get("target@dev").map(str::to_string),
        DeviceKind::Interface => get("mac@address").map(str::to_string),
        DeviceKind::Controller => get("@type")
            .map(|t| format!("{}:{}", t, get("@index").unwrap_or("0"))),
        DeviceKind::Serial | DeviceKind::Console => {
            let target_type = get("target@type").or(get("@type")).unwrap_or("pty");
            Some(format!(
                "{}:{}",
                target_type,
                get("target@port")
                    .map(str::to_string)
                    .unwrap_or_else(|| ordinal.to_string())
            ))
        }
        DeviceKind::Channel => get("target@name").map(str::to_string),
        _ => None,
    };
    keyed.unwrap_or_else(|| ordinal.to_string())
}

#[derive(Default)]
struct ElementTree {
    attrs: BTreeMap<String, String>,
    text: Option<String>,
    children: BTreeMap<String, ElementTree>,
}

fn unflatten(attrs: &BTreeMap<String, String>) -> ElementTree {
    let mut root = ElementTree::default();
    for (key, value) in attrs {
        let (path, attr) = match key.split_once('@') {
            Some((path, attr)) => (path, Some(attr)),
            None => (key.as_str(), None),
        };

        let mut node = &mut root;
        if !path.is_empty() && path != "." {
            for segment in path.split('/') {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }

        match attr {
            Some(attr) => {
                node.attrs.insert(attr.to_string(), value.clone());
            }
            None => node.text = Some(value.clone()),
        }
    }
    root
}

fn write_element(out: &mut String, name: &str, el: &ElementTree) {
    let _ = write!(out, "<{}", name);
    for (attr, value) in &el.attrs {
        let _ = write!(out, " {}='{}'", attr, escape(value));
    }
    let text = el.text.as_deref().filter(|t| !t.is_empty());
    if text.is_none() && el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    if let Some(text) = text {
        out.push_str(&escape(text));
    }
    for (segment, child) in &el.children {
        let tag = segment.split('[').next().unwrap_or(segment);
        write_element(out, tag, child);
    }
    let _ = write!(out, "</{}>", name);
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}
