// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NUMA topology as reported in hypervisor capabilities.

use std::collections::BTreeMap;

/// Maps each NUMA cell id in `capabilities` to the compressed list of host
/// CPUs it contains.
///
/// Only `<cell>` elements inside `<topology><cells>` are considered.
pub fn cell_cpusets(capabilities: &str) -> BTreeMap<String, String> {
    let mut cells = BTreeMap::new();

    let Some(topology) = section(capabilities, "<topology>", "</topology>")
    else {
        return cells;
    };
    let Some(cells_xml) = section(topology, "<cells", "</cells>") else {
        return cells;
    };

    for cell in elements(cells_xml, "cell") {
        let Some(id) = attr(cell.tag, "id") else {
            continue;
        };
        let cpus: Vec<u32> = elements(cell.body, "cpu")
            .filter_map(|cpu| attr(cpu.tag, "id")?.parse().ok())
            .collect();
        cells.insert(id.to_string(), compress_cpu_list(&cpus));
    }
    cells
}

/// Renders CPU ids as a libvirt cpuset, collapsing ascending runs:
/// `[0, 1, 2, 3, 8]` becomes `0-3,8`.
pub fn compress_cpu_list(cpus: &[u32]) -> String {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &cpu in cpus {
        match runs.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(cpu) => *end = cpu,
            _ => runs.push((cpu, cpu)),
        }
    }
    runs.iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn section<'a>(xml: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = xml.find(open)?;
    let len = xml[start..].find(close)?;
    Some(&xml[start..start + len])
}

struct Element<'a> {
    /// The opening tag, without the angle brackets.
    tag: &'a str,
    /// Content up to the closing tag; empty for self-closing elements.
    body: &'a str,
}

/// Iterates over the `name` elements of `xml`, not descending into them.
fn elements<'a>(
    xml: &'a str,
    name: &'a str,
) -> impl Iterator<Item = Element<'a>> + 'a {
    let mut rest = xml;
    std::iter::from_fn(move || loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        let end = rest.find('>')?;
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        let tag_name = tag
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        if tag_name != name {
            continue;
        }
        if tag.ends_with('/') {
            return Some(Element { tag, body: "" });
        }
        let close = format!("</{name}>");
        let body_end = rest.find(&close).unwrap_or(rest.len());
        let body = &rest[..body_end];
        rest = &rest[(body_end + close.len()).min(rest.len())..];
        return Some(Element { tag, body });
    })
}

fn attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = tag;
    while let Some(pos) = rest.find(name) {
        let before_ok = pos == 0
            || rest[..pos].ends_with(|c: char| c.is_whitespace());
        let after = rest[pos + name.len()..].trim_start();
        if before_ok {
            if let Some(value) = after.strip_prefix('=') {
                let value = value.trim_start();
                let quote = value.chars().next()?;
                if quote == '\'' || quote == '"' {
                    let value = &value[1..];
                    return value.find(quote).map(|end| &value[..end]);
                }
            }
        }
        rest = &rest[pos + name.len()..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITIES: &str = r#"<capabilities>
  <host>
    <uuid>0f4f2f6a-5c1c-4b64-9d4c-2b9c2ec1c0f1</uuid>
    <cpu>
      <arch>x86_64</arch>
      <topology sockets='1' cores='4' threads='1'/>
    </cpu>
    <topology>
      <cells num='2'>
        <cell id='0'>
          <memory unit='KiB'>8000000</memory>
          <cpus num='4'>
            <cpu id='0' socket_id='0' core_id='0' siblings='0'/>
            <cpu id='1' socket_id='0' core_id='1' siblings='1'/>
            <cpu id='2' socket_id='0' core_id='2' siblings='2'/>
            <cpu id='3' socket_id='0' core_id='3' siblings='3'/>
          </cpus>
        </cell>
        <cell id="1">
          <cpus num='3'>
            <cpu id="4"/>
            <cpu id="6"/>
            <cpu id="7"/>
          </cpus>
        </cell>
      </cells>
    </topology>
  </host>
</capabilities>"#;

    #[test]
    fn reads_cells_from_topology() {
        let cells = cell_cpusets(CAPABILITIES);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells["0"], "0-3");
        assert_eq!(cells["1"], "4,6-7");
    }

    #[test]
    fn no_topology_yields_nothing() {
        assert!(cell_cpusets("<capabilities><host/></capabilities>").is_empty());
    }

    #[test]
    fn compresses_runs() {
        assert_eq!(compress_cpu_list(&[0, 1, 2, 3, 8, 9]), "0-3,8-9");
        assert_eq!(compress_cpu_list(&[5]), "5");
        assert_eq!(compress_cpu_list(&[0, 2, 4]), "0,2,4");
        assert_eq!(compress_cpu_list(&[]), "");
    }

    #[test]
    fn attribute_lookup_requires_whole_name() {
        assert_eq!(attr("cpu socket_id='0' id='3'", "id"), Some("3"));
        assert_eq!(attr("cpu socket_id='0'", "id"), None);
    }
}
