//! End-to-end tests driving `Session` the way a real caller would: cache a
//! bundle, extract/filter/assign/join/merge views over it, read the result
//! back out. Mirrors the scenarios a STIX observable store is actually
//! exercised with, rather than exhaustive per-function unit coverage.

use std::collections::BTreeMap;

use firepit_store::Session;
use serde_json::{json, Value as Json};

fn session(test_name: &str) -> Session {
    Session::open(":memory:", test_name).unwrap()
}

/// A small synthetic bundle: 10 urls (4 matching "/page/1" as a prefix
/// collision with "/page/10".."/page/19"), network-traffic with a mix of
/// dst ports including ssh (22), and an ipv4-addr src/dst pair per
/// connection.
fn sample_bundle() -> Json {
    let mut objects = Vec::new();
    for i in 0..20 {
        objects.push(json!({
            "type": "url",
            "id": format!("url--{i:02}"),
            "value": format!("http://example.com/page/{i}"),
        }));
    }
    for i in 0..5 {
        objects.push(json!({
            "type": "network-traffic",
            "id": format!("network-traffic--{i}"),
            "dst_port": if i < 3 { 22 } else { 443 },
            "src_ref": {
                "type": "ipv4-addr",
                "id": format!("ipv4-addr--src{i}"),
                "value": format!("10.0.0.{}", i + 1),
            },
            "dst_ref": {
                "type": "ipv4-addr",
                "id": format!("ipv4-addr--dst{i}"),
                "value": format!("192.168.0.{}", i + 1),
            },
        }));
    }
    json!({"type": "bundle", "objects": objects})
}

#[test]
fn extract_and_read_values() {
    let mut store = session("extract_and_read_values");
    store.cache("q1", &sample_bundle()).unwrap();

    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    let values = store.values("url:value", "urls").unwrap();
    // page/1, page/10..page/19 = 11 matches
    assert_eq!(values.len(), 11);
}

#[test]
fn lookup_supports_limit_offset_and_column_projection() {
    let mut store = session("lookup_supports_limit_offset_and_column_projection");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls", "url", "q1", "[url:value LIKE '%']").unwrap();

    let page = store.lookup("urls", Some(5), None, None).unwrap();
    assert_eq!(page.rows.len(), 5);

    let cols = vec!["value".to_string(), "number_observed".to_string()];
    let projected = store.lookup("urls", Some(5), Some(2), Some(&cols)).unwrap();
    assert_eq!(projected.rows.len(), 5);
    assert_eq!(projected.columns, cols);
}

#[test]
fn assign_sort_rebinding_the_source_name_carries_through_to_dependents() {
    let mut store = session("assign_sort_rebinding_the_source_name_carries_through_to_dependents");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();

    store.assign("sorted", "urls", "sort", "value", true, None).unwrap();
    assert_eq!(store.values("url:value", "sorted").unwrap().len(), 11);

    // Redefining `urls` changes what `sorted` sees too - `sorted` is a
    // definition over `urls`, not a snapshot of its old contents.
    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/2%']").unwrap();
    assert_eq!(store.values("url:value", "urls").unwrap().len(), 1);
    assert_eq!(store.values("url:value", "sorted").unwrap().len(), 1);
}

#[test]
fn assign_sort_rebinding_onto_its_own_name_keeps_current_membership() {
    let mut store = session("assign_sort_rebinding_onto_its_own_name_keeps_current_membership");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    let before: std::collections::BTreeSet<_> = store
        .values("url:value", "urls")
        .unwrap()
        .into_iter()
        .map(|v| v.to_string())
        .collect();

    store.assign("urls", "urls", "sort", "value", true, None).unwrap();
    let after: std::collections::BTreeSet<_> = store
        .values("url:value", "urls")
        .unwrap()
        .into_iter()
        .map(|v| v.to_string())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn assign_group_collapses_and_aggregates() {
    let mut store = session("assign_group_collapses_and_aggregates");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract("conns", "network-traffic", "q1", "[network-traffic:dst_port = 22]")
        .unwrap();
    store.assign("conns", "conns", "group", "dst_port", true, None).unwrap();

    let cols = store.columns("conns").unwrap();
    assert!(cols.contains(&"unique_dst_port".to_string()) || cols.iter().any(|c| c.starts_with("unique_")));
    let rows = store.lookup("conns", None, None, None).unwrap();
    assert_eq!(rows.rows.len(), 1);
}

#[test]
fn assign_group_sums_number_observed_across_collapsed_rows() {
    let mut store = session("assign_group_sums_number_observed_across_collapsed_rows");
    let bundle = sample_bundle();
    // Re-ingesting the same ids under a second query_id doubles each row's
    // `number_observed` (spec §3/§4.6 identity summation) before grouping.
    store.cache("q1", &bundle).unwrap();
    store.cache("q2", &bundle).unwrap();
    store
        .extract("conns", "network-traffic", "q1", "[network-traffic:dst_port = 22]")
        .unwrap();
    store.assign("conns", "conns", "group", "dst_port", true, None).unwrap();

    let rows = store.lookup("conns", None, None, None).unwrap();
    assert_eq!(rows.rows.len(), 1);
    let idx = rows.column_index("number_observed").unwrap();
    // 3 ssh connections, each observed twice, summed into the one group.
    assert_eq!(rows.rows[0][idx].as_integer(), Some(6));
}

#[test]
fn extract_cidr_issubset_matches_addresses_inside_the_network() {
    let mut store = session("extract_cidr_issubset_matches_addresses_inside_the_network");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract("local_ips", "ipv4-addr", "q1", "[ipv4-addr:value ISSUBSET '10.0.0.0/24']")
        .unwrap();

    let values = store.values("ipv4-addr:value", "local_ips").unwrap();
    let values: std::collections::BTreeSet<_> = values.into_iter().map(|v| v.to_string()).collect();
    assert!(values.contains("10.0.0.1"));
    assert!(!values.contains("192.168.0.1"));
    assert_eq!(values.len(), 5);
}

#[test]
fn extract_matches_applies_a_regex_against_values() {
    let mut store = session("extract_matches_applies_a_regex_against_values");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract("urls", "url", "q1", "[url:value MATCHES 'page/1[0-9]$']")
        .unwrap();

    // page/10..page/19 - ten matches.
    assert_eq!(store.count("urls").unwrap(), 10);
}

#[test]
fn extract_in_and_not_combine_set_membership_with_negation() {
    let mut store = session("extract_in_and_not_combine_set_membership_with_negation");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract(
            "picked",
            "url",
            "q1",
            "[url:value IN ('http://example.com/page/1', 'http://example.com/page/2')]",
        )
        .unwrap();
    assert_eq!(store.count("picked").unwrap(), 2);

    store
        .extract(
            "not_picked",
            "url",
            "q1",
            "[url:value NOT IN ('http://example.com/page/1', 'http://example.com/page/2')]",
        )
        .unwrap();
    assert_eq!(store.count("not_picked").unwrap(), 18);
}

#[test]
fn join_enriches_matching_rows_and_leaves_others_null() {
    let mut store = session("join_enriches_matching_rows_and_leaves_others_null");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract("local_ips", "ipv4-addr", "q1", "[ipv4-addr:value LIKE '10.0.0.%']")
        .unwrap();

    let mut enrichment = BTreeMap::new();
    enrichment.insert("type".to_string(), Json::String("ipv4-addr".to_string()));
    enrichment.insert("value".to_string(), Json::String("10.0.0.1".to_string()));
    enrichment.insert("risk".to_string(), Json::String("high".to_string()));
    store.load("marks", &[enrichment], Some("ipv4-addr"), None).unwrap();

    store.join("marked", "local_ips", "value", "marks", "value").unwrap();
    let result = store.lookup("marked", None, None, None).unwrap();
    let value_idx = result.column_index("value").unwrap();
    let risk_idx = result.column_index("risk").unwrap();
    let mut saw_high = false;
    for row in &result.rows {
        if row[value_idx].as_text() == Some("10.0.0.1") {
            assert_eq!(row[risk_idx].as_text(), Some("high"));
            saw_high = true;
        } else {
            assert!(row[risk_idx].is_null());
        }
    }
    assert!(saw_high);
}

#[test]
fn filter_narrows_an_existing_view_in_place() {
    let mut store = session("filter_narrows_an_existing_view_in_place");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    store
        .filter("urls", "url", "urls", "[url:value = 'http://example.com/page/10']")
        .unwrap();

    let values = store.values("url:value", "urls").unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(store.views().unwrap(), vec!["urls".to_string()]);
}

#[test]
fn filter_across_a_ref_projects_into_the_referenced_type_deduplicated() {
    let mut store = session("filter_across_a_ref_projects_into_the_referenced_type_deduplicated");
    store.cache("q1", &sample_bundle()).unwrap();
    store
        .extract("ssh_conns", "network-traffic", "q1", "[network-traffic:dst_port = 22]")
        .unwrap();
    assert_eq!(store.count("ssh_conns").unwrap(), 3);

    store
        .filter("ssh_ips", "ipv4-addr", "ssh_conns", "[network-traffic:dst_port = 22]")
        .unwrap();
    // Each ssh connection has a distinct src and dst ip, so walking both
    // ref columns yields 6 distinct ipv4-addr rows, not a doubled 6 from
    // counting each connection's two refs as if they were the same row.
    assert_eq!(store.count("ssh_ips").unwrap(), 6);
}

#[test]
fn reassign_enriches_rows_without_disturbing_the_source_view() {
    let mut store = session("reassign_enriches_rows_without_disturbing_the_source_view");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();

    let rows = store.lookup("urls", None, None, None).unwrap();
    let id_idx = rows.column_index("id").unwrap();
    let mut records = Vec::new();
    for row in &rows.rows {
        let mut rec = BTreeMap::new();
        rec.insert("type".to_string(), Json::String("url".to_string()));
        rec.insert("id".to_string(), Json::String(row[id_idx].as_text().unwrap().to_string()));
        rec.insert("x_enrich".to_string(), Json::Number(1.into()));
        records.push(rec);
    }
    let enriched_count = records.len();

    store.reassign("enriched_urls", &records).unwrap();
    assert_eq!(store.count("enriched_urls").unwrap(), enriched_count as i64);

    // The original view's membership is untouched, but its rows' data is
    // shared, so the enrichment shows up there too.
    assert_eq!(store.count("urls").unwrap(), enriched_count as i64);
    let enriched_cols = store.columns("urls").unwrap();
    assert!(enriched_cols.contains(&"x_enrich".to_string()));
}

#[test]
fn appdata_is_visible_to_a_second_handle_on_the_same_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let path = path.to_str().unwrap();

    {
        let mut store = Session::open(path, "s1").unwrap();
        store.cache("q1", &sample_bundle()).unwrap();
        store.extract("ssh_conns", "network-traffic", "q1", "[network-traffic:dst_port = 22]").unwrap();
        store.set_appdata("ssh_conns", br#"{"foo":99}"#).unwrap();
    }

    let mut reopened = Session::open(path, "s1").unwrap();
    let blob = reopened.get_appdata("ssh_conns").unwrap().unwrap();
    assert_eq!(blob, br#"{"foo":99}"#);
}

#[test]
fn merge_unions_and_is_independent_of_its_sources() {
    let mut store = session("merge_unions_and_is_independent_of_its_sources");
    store.cache("q1", &sample_bundle()).unwrap();
    let all_urls = store.values("url:value", "url").unwrap().len();

    store.extract("urls1", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    store.extract("urls2", "url", "q1", "[url:value NOT LIKE '%/page/1%']").unwrap();
    store
        .merge("merged", &["urls1".to_string(), "urls2".to_string()])
        .unwrap();
    assert_eq!(store.count("merged").unwrap() as usize, all_urls);

    store.remove("urls1").unwrap();
    store.remove("urls2").unwrap();
    assert_eq!(store.count("merged").unwrap() as usize, all_urls);
}

#[test]
fn remove_leaves_other_views_and_unknown_views_error() {
    let mut store = session("remove_leaves_other_views_and_unknown_views_error");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls1", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    store.extract("urls2", "url", "q1", "[url:value LIKE '%/page/2%']").unwrap();

    store.remove("urls1").unwrap();
    assert!(store.lookup("urls1", None, None, None).is_err());
    assert!(store.count("urls2").unwrap() > 0);
}

#[test]
fn rename_moves_a_view_to_its_new_name() {
    let mut store = session("rename_moves_a_view_to_its_new_name");
    store.cache("q1", &sample_bundle()).unwrap();
    store.extract("urls1", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    let count_before = store.count("urls1").unwrap();

    store.rename("urls1", "urls2").unwrap();
    assert!(store.lookup("urls1", None, None, None).is_err());
    assert_eq!(store.count("urls2").unwrap(), count_before);
}

#[test]
fn caching_the_same_bundle_twice_under_different_query_ids_is_idempotent() {
    let mut store = session("caching_the_same_bundle_twice_under_different_query_ids_is_idempotent");
    let bundle = sample_bundle();
    store.cache("q1", &bundle).unwrap();
    store.extract("urls1", "url", "q1", "[url:value LIKE '%/page/1%']").unwrap();
    let count1 = store.values("url:value", "urls1").unwrap().len();

    store.cache("q2", &bundle).unwrap();
    store.extract("urls2", "url", "q2", "[url:value LIKE '%/page/1%']").unwrap();
    let count2 = store.values("url:value", "urls2").unwrap().len();

    assert_eq!(count1, count2);
}

#[test]
fn delete_wipes_every_table_in_this_session_but_not_other_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let path = path.to_str().unwrap();

    let mut a = Session::open(path, "a").unwrap();
    a.cache("q1", &sample_bundle()).unwrap();
    a.extract("urls", "url", "q1", "[url:value LIKE '%']").unwrap();

    let mut b = Session::open(path, "b").unwrap();
    b.cache("q1", &sample_bundle()).unwrap();
    b.extract("urls", "url", "q1", "[url:value LIKE '%']").unwrap();

    a.delete().unwrap();
    assert!(a.tables().unwrap().is_empty());
    assert!(!b.tables().unwrap().is_empty());
}
