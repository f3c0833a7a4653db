use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use thucydides::{BranchFilter, Clusterer, Config, ElementKind, Roots, VersionGraph, VersionInfo, reconstruct};

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 3, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

const AUTHORS: [&str; 3] = ["ann", "bob", "cid"];

/// One single-version file per entry: (oid, author, minute).
fn graph_of(entries: &[(String, usize, i64)]) -> VersionGraph {
    let mut graph = VersionGraph::new();
    for (oid, author, minute) in entries {
        let element = graph.add_element(oid.as_str(), oid, ElementKind::File);
        graph.add_branch(element, "main", None);
        graph
            .add_version(element, "main", 1, VersionInfo::new(AUTHORS[*author], at(*minute)))
            .unwrap();
    }
    graph
}

/// Changesets as sets of element oids, with their time bounds.
fn groupings(entries: &[(String, usize, i64)]) -> BTreeSet<(String, Vec<String>, DateTime<Utc>, DateTime<Utc>)> {
    let mut graph = graph_of(entries);
    let roots = Roots::new(&[]);
    let filter = BranchFilter::default();
    let raw = Clusterer::new(&roots, &filter, Duration::minutes(30))
        .build(&mut graph, None, None)
        .unwrap();
    raw.changesets
        .iter()
        .map(|c| {
            let mut oids: Vec<String> = c
                .versions
                .iter()
                .map(|v| graph.element_of(v.version).oid.to_string())
                .collect();
            oids.sort();
            (c.author_login.clone(), oids, c.start, c.finish)
        })
        .collect()
}

fn entries() -> impl Strategy<Value = Vec<(String, usize, i64)>> {
    prop::collection::vec((0..AUTHORS.len(), 0i64..600), 1..24).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (author, minute))| (format!("file{i}"), author, minute))
            .collect()
    })
}

proptest! {
    #[test]
    fn clustering_ignores_input_order(
        (original, shuffled) in entries().prop_flat_map(|e| (Just(e.clone()), Just(e).prop_shuffle()))
    ) {
        prop_assert_eq!(groupings(&original), groupings(&shuffled));
    }

    #[test]
    fn changesets_span_their_versions(entries in entries()) {
        let graph = graph_of(&entries);
        for (_, oids, start, finish) in groupings(&entries) {
            prop_assert!(start <= finish);
            for oid in oids {
                let (_, element) = graph.elements().find(|(_, e)| e.oid.to_string() == oid).unwrap();
                let date = graph.version(element.branches()[0].versions[0]).date;
                prop_assert!(start <= date && date <= finish);
            }
        }
    }
}

#[test]
fn emitted_ids_are_contiguous_and_reference_earlier_commits() {
    let mut graph = VersionGraph::new();
    let root = graph.add_element("root", ".", ElementKind::Directory);
    graph.add_branch(root, "main", None);
    let mut files = Vec::new();
    for name in ["a", "b", "c"] {
        let element = graph.add_element(name, name, ElementKind::File);
        graph.add_branch(element, "main", None);
        files.push((name.to_string(), element));
    }
    let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(0))).unwrap();
    graph.set_content(r1, files.clone());

    let mut main_tips = Vec::new();
    for (i, (_, element)) in files.iter().enumerate() {
        let v1 = graph
            .add_version(*element, "main", 1, VersionInfo::new("ann", at(i as i64 * 5)))
            .unwrap();
        main_tips.push(v1);
    }
    // one dev branch per file pair, merged back later
    graph.add_branch(files[0].1, "main/dev", Some(main_tips[0]));
    graph.add_branch(files[1].1, "main/dev", Some(main_tips[1]));
    graph.add_version(files[0].1, "dev", 0, VersionInfo::new("bob", at(60))).unwrap();
    graph.add_version(files[1].1, "dev", 0, VersionInfo::new("bob", at(60))).unwrap();
    let dev_a = graph.add_version(files[0].1, "dev", 1, VersionInfo::new("bob", at(120))).unwrap();
    let dev_b = graph.add_version(files[1].1, "dev", 1, VersionInfo::new("bob", at(125))).unwrap();
    graph.add_version(files[2].1, "main", 2, VersionInfo::new("cid", at(180))).unwrap();
    let main_a = graph.add_version(files[0].1, "main", 2, VersionInfo::new("ann", at(300))).unwrap();
    let main_b = graph.add_version(files[1].1, "main", 2, VersionInfo::new("ann", at(305))).unwrap();
    graph.add_merge(dev_a, main_a);
    graph.add_merge(dev_b, main_b);

    let plan = reconstruct(&mut graph, &Config::default(), None).unwrap().plan;
    let marks: Vec<usize> = plan.commits.iter().map(|c| c.mark).collect();
    assert_eq!(marks, (1..=plan.commits.len()).collect::<Vec<_>>());
    for commit in &plan.commits {
        for reference in commit.from.iter().chain(&commit.merges) {
            assert!(*reference < commit.mark, "commit {} refers to {reference}", commit.mark);
        }
    }
    assert!(plan.commits.iter().any(|c| !c.merges.is_empty()));
}
