//! Square-root cross-group assignment.
//!
//! Users are routed through several groups so that the anonymity set spans
//! more than one cascade. With `G` groups, `L = ⌈√(2G − 0.25) − 0.5⌉`
//! templates of up to `L` groups each are built over the sorted group list
//! using a projective-plane-like construction: every pair of templates
//! shares at least one group, and every group appears in two or three
//! templates.

use std::collections::HashMap;

use crate::Group;

/// Build the `L + 1` assignment templates over the given groups. Each
/// template is a list of gids; a user assigned to a template sends one
/// ciphertext per listed group.
pub fn assignments(groups: &HashMap<String, Group>) -> Vec<Vec<String>> {
    let n = groups.len();
    if n == 0 {
        return Vec::new();
    }
    let l = ((2.0 * n as f64 - 0.25).sqrt() - 0.5).ceil() as usize;

    let mut glist: Vec<&String> = groups.keys().collect();
    glist.sort();

    let mut templates: Vec<Vec<&String>> = Vec::with_capacity(l + 1);
    templates.push(glist.iter().take(l).copied().collect());
    let mut last = l - 1;

    for i in 1..=l {
        let mut template: Vec<&String> = Vec::with_capacity(l);
        // one group out of each earlier template's slot i-1
        for j in 0..i {
            if templates[j].len() > i - 1 {
                template.push(templates[j][i - 1]);
            }
        }
        // pad with fresh groups, wrapping onto earlier picks when exhausted
        let mut wrap = 0;
        while template.len() < l {
            if last + 1 >= n {
                let repeat = template[wrap];
                template.push(repeat);
                wrap += 1;
            } else {
                last += 1;
                template.push(glist[last]);
            }
        }
        templates.push(template);
    }

    templates
        .into_iter()
        .map(|t| {
            let mut seen = Vec::with_capacity(t.len());
            for gid in t {
                if !seen.contains(&gid) {
                    seen.push(gid);
                }
            }
            seen.into_iter().cloned().collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_groups(n: usize) -> HashMap<String, Group> {
        (0..n)
            .map(|i| {
                let gid = format!("group:{i}");
                (
                    gid.clone(),
                    Group {
                        gid,
                        row: i as u32,
                        servers: Vec::new(),
                    },
                )
            })
            .collect()
    }

    fn disjoint(a: &[String], b: &[String]) -> bool {
        a.iter().all(|g| !b.contains(g))
    }

    #[test]
    fn no_disjoint_template_pair_and_bounded_repetition() {
        for n in 4..=200 {
            let groups = make_groups(n);
            let templates = assignments(&groups);

            for (i, a) in templates.iter().enumerate() {
                for b in templates.iter().skip(i + 1) {
                    assert!(!disjoint(a, b), "disjoint templates for {n} groups");
                }
            }

            let mut counts: HashMap<&String, usize> = HashMap::new();
            for template in &templates {
                for gid in template {
                    *counts.entry(gid).or_default() += 1;
                }
            }
            assert_eq!(counts.len(), n, "every group must be assigned ({n})");
            for (gid, count) in counts {
                assert!(
                    (2..=3).contains(&count),
                    "group {gid} appears {count} times for {n} groups"
                );
            }
        }
    }

    #[test]
    fn forty_groups() {
        let groups = make_groups(40);
        let templates = assignments(&groups);
        // L = ceil(sqrt(79.75) - 0.5) = 9
        assert_eq!(templates.len(), 10);
        for template in &templates {
            assert!(template.len() <= 9);
            let mut dedup = template.clone();
            dedup.dedup();
            assert_eq!(&dedup, template, "templates contain no duplicates");
        }
    }
}
