//! Device category heuristic.
//!
//! An ordered decision list over lowercase substring matches of the vendor
//! and hostname, plus a few well-known open ports. The first matching rule
//! wins, so the order of the checks below is part of the product behaviour.

use std::collections::HashSet;

use crate::types::{Category, PortFinding};

const ROUTER_VENDORS: &[&str] = &[
    "cisco", "netgear", "ubiquiti", "asus", "tp-link", "linksys", "zyxel", "dlink", "d-link",
];
const ROUTER_HOSTNAMES: &[&str] = &["router", "gateway", "gw", "fw", "firewall"];
const ROUTER_VENDOR_HINTS: &[&str] = &["router", "modem"];
const WEB_PORTS: &[u16] = &[80, 443, 8080];

const APPLE_PHONE_HOSTNAMES: &[&str] = &["iphone", "ipad"];

const PHONE_VENDORS: &[&str] = &["samsung", "huawei", "xiaomi", "oneplus", "google", "motorola"];
const PHONE_HOSTNAMES: &[&str] = &["phone", "android", "iphone", "ipad", "tablet"];

const TV_VENDORS: &[&str] = &["roku", "amazon", "nvidia", "sonos", "logitech media"];
const TV_HOSTNAMES: &[&str] = &["tv", "firetv", "appletv", "chromecast", "shield", "roku", "kodi"];
const CAST_PORTS: &[u16] = &[8008, 8009];

const PRINTER_VENDORS: &[&str] = &["hp", "epson", "canon", "brother", "xerox", "lexmark", "ricoh"];
const PRINTER_HOSTNAMES: &[&str] = &["printer", "print"];
const PRINTER_PORTS: &[u16] = &[9100, 631];

const SERVER_HOSTNAMES: &[&str] = &["server", "nas", "synology", "qnap", "pi", "raspberry"];

const PC_VENDORS: &[&str] = &["intel", "realtek", "dell", "lenovo", "hewlett"];

/// Map vendor, hostname and probe findings to a category label.
///
/// Only findings in the `open` state count as open ports.
pub fn classify(vendor: Option<&str>, hostname: Option<&str>, ports: &[PortFinding]) -> Category {
    let vendor = vendor.unwrap_or_default().to_lowercase();
    let hostname = hostname.unwrap_or_default().to_lowercase();
    let open: HashSet<u16> = ports.iter().filter(|p| p.is_open()).map(|p| p.port).collect();

    let any_open = |candidates: &[u16]| candidates.iter().any(|p| open.contains(p));

    if contains_any(&vendor, ROUTER_VENDORS) || contains_any(&hostname, ROUTER_HOSTNAMES) {
        return Category::Router;
    }
    if any_open(WEB_PORTS) && !open.contains(&22) && contains_any(&vendor, ROUTER_VENDOR_HINTS) {
        return Category::Router;
    }

    if vendor.contains("apple") {
        if contains_any(&hostname, APPLE_PHONE_HOSTNAMES) {
            return Category::Phone;
        }
        // macbook/imac hostnames and bare Apple NICs alike.
        return Category::Laptop;
    }

    if contains_any(&vendor, PHONE_VENDORS) || contains_any(&hostname, PHONE_HOSTNAMES) {
        return Category::Phone;
    }

    if contains_any(&vendor, TV_VENDORS) || contains_any(&hostname, TV_HOSTNAMES) {
        return Category::Tv;
    }
    if any_open(CAST_PORTS) {
        return Category::Tv;
    }

    if contains_any(&vendor, PRINTER_VENDORS) || contains_any(&hostname, PRINTER_HOSTNAMES) {
        return Category::Printer;
    }
    if any_open(PRINTER_PORTS) {
        return Category::Printer;
    }

    if open.contains(&22) && (open.contains(&80) || open.contains(&443)) {
        return Category::Server;
    }
    if contains_any(&hostname, SERVER_HOSTNAMES) {
        return Category::Server;
    }

    if contains_any(&vendor, PC_VENDORS) {
        return Category::Laptop;
    }

    Category::Device
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    !haystack.is_empty() && needles.iter().any(|n| haystack.contains(n))
}
