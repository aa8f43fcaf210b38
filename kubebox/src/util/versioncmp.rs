//! Ordering for container runtime release strings.
//!
//! Release candidates (`-rc<N>`) sort as an extra sub-version, and every
//! community-edition release (`-ce`) sorts after every release that predates
//! CE versioning.

use std::cmp::Ordering;

pub fn compare(v1: &str, v2: &str) -> Ordering {
    let v1 = v1.replace("-rc", ".");
    let v2 = v2.replace("-rc", ".");

    match (v1.contains("ce"), v2.contains("ce")) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    let v1 = v1.replace("-ce", "");
    let v2 = v2.replace("-ce", "");
    let left: Vec<&str> = v1.split('.').collect();
    let right: Vec<&str> = v2.split('.').collect();

    for i in 0..left.len().max(right.len()) {
        let a = component(&left, i);
        let b = component(&right, i);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// Missing or non-numeric components count as zero.
fn component(parts: &[&str], i: usize) -> u64 {
    parts.get(i).and_then(|p| p.parse().ok()).unwrap_or(0)
}

pub fn less_than(v1: &str, v2: &str) -> bool {
    compare(v1, v2) == Ordering::Less
}

pub fn less_than_or_equal_to(v1: &str, v2: &str) -> bool {
    compare(v1, v2) != Ordering::Greater
}

pub fn greater_than(v1: &str, v2: &str) -> bool {
    compare(v1, v2) == Ordering::Greater
}
