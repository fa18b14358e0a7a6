//! Property-based tests for user name rewriting.

use std::collections::BTreeSet;
use std::io::{Cursor, Write};

use proptest::prelude::*;
use zip::write::FileOptions;
use zip::ZipWriter;

use jira_export_core::config::FieldSet;
use jira_export_core::models::TransformReport;
use jira_export_core::xml::{rewrite_document, Hits};
use jira_export_core::{ExportTransformer, Prescription, RenameRule, RuleSet};

/// Where a name is placed in a generated document.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Element,
    Attribute,
    FreeText,
}

fn slot() -> impl Strategy<Value = Slot> {
    prop_oneof![
        Just(Slot::Element),
        Just(Slot::Attribute),
        Just(Slot::FreeText)
    ]
}

fn render(items: &[(Slot, String)]) -> String {
    let mut out = String::from("<root>\n");
    for (slot, name) in items {
        match slot {
            Slot::Element => out.push_str(&format!("  <lead>{}</lead>\n", name)),
            Slot::Attribute => out.push_str(&format!("  <Action author=\"{}\" id=\"1\"/>\n", name)),
            Slot::FreeText => out.push_str(&format!("  <summary>{}</summary>\n", name)),
        }
    }
    out.push_str("</root>\n");
    out
}

/// Old names never contain a dot, new names always do, so the two sets are
/// disjoint.
fn rules_for(olds: &BTreeSet<String>) -> RuleSet {
    RuleSet::from_rules(olds.iter().map(|o| RenameRule::new(o.as_str(), format!("{}.new", o))))
        .unwrap()
}

fn apply(xml: &str, rules: &RuleSet) -> String {
    let mut hits = Hits::new();
    rewrite_document("prop.xml", xml, rules, &FieldSet::default(), &mut hits)
        .unwrap()
        .unwrap_or_else(|| xml.to_string())
}

fn document() -> impl Strategy<Value = (BTreeSet<String>, Vec<(Slot, String)>)> {
    prop::collection::btree_set("[a-z]{3,8}", 1..5).prop_flat_map(|olds| {
        let pool: Vec<String> = olds.iter().cloned().collect();
        let name = prop_oneof![
            prop::sample::select(pool),
            "[a-z]{3,8}",
        ];
        (
            Just(olds),
            prop::collection::vec((slot(), name), 0..12),
        )
    })
}

proptest! {
    #[test]
    fn prop_user_fields_renamed_everything_else_kept((olds, items) in document()) {
        let rules = rules_for(&olds);
        let expected: Vec<(Slot, String)> = items
            .iter()
            .map(|(slot, name)| match slot {
                Slot::FreeText => (*slot, name.clone()),
                _ => (*slot, rules.lookup(name).unwrap_or(name.as_str()).to_string()),
            })
            .collect();

        prop_assert_eq!(apply(&render(&items), &rules), render(&expected));
    }

    #[test]
    fn prop_rewrite_is_idempotent((olds, items) in document()) {
        let rules = rules_for(&olds);
        let once = apply(&render(&items), &rules);
        let twice = apply(&once, &rules);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_document_without_old_names_untouched(
        names in prop::collection::vec("[a-z]{3,8}", 0..10)
    ) {
        let items: Vec<(Slot, String)> =
            names.into_iter().map(|n| (Slot::Element, n)).collect();
        // Upper-case old names can never collide with generated lower-case ones.
        let rules = RuleSet::from_rules([RenameRule::new("ALICE", "bob")]).unwrap();
        let mut hits = Hits::new();
        let result =
            rewrite_document("prop.xml", &render(&items), &rules, &FieldSet::default(), &mut hits)
                .unwrap();
        prop_assert!(result.is_none());
        prop_assert!(hits.is_empty());
    }

    #[test]
    fn prop_empty_rules_keep_archive_bytes(
        contents in prop::collection::vec(("[a-z]{1,8}", "[ -~]{0,64}"), 1..6)
    ) {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (i, (stem, body)) in contents.iter().enumerate() {
            let options: FileOptions<'_, ()> = FileOptions::default();
            writer.start_file(format!("{}{}.xml", stem, i), options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let prescription = Prescription::default();
        let mut report = TransformReport::default();
        let result = ExportTransformer::new(&prescription)
            .transform_bytes("prop.zip", &bytes, &mut report)
            .unwrap();

        prop_assert!(result.is_none());
        prop_assert!(!report.changed());
    }
}
