use super::*;
use crate::assign::{ensure_assigned, plan_assignment};
use crate::model::{combos, BranchKey, Message, Role};
use crate::store::load_records;
use serde_json::json;

fn conversation(source: &str, index: u64) -> Record {
    let mut metadata = serde_json::Map::new();
    metadata.insert("topic".to_string(), json!("logic"));
    Record {
        source: source.to_string(),
        index,
        messages: vec![
            Message::new(Role::System, "be careful"),
            Message::new(Role::User, format!("question {index}")),
            Message::new(Role::Assistant, format!("answer {index}")),
        ],
        metadata,
    }
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Sample, plan and assign `n` records over a/b x x/y/z.
fn prepared(paths: &ArtifactPaths, n: u64) -> (Vec<Record>, AssignmentPlan) {
    let branch = BranchKey::new("src", "train");
    let raw: Vec<Record> = (0..n).map(|index| conversation("src", index)).collect();
    let combos = combos(&names(&["a", "b"]), &names(&["x", "y", "z"]));
    let plan = plan_assignment(&branch, &raw, &combos, 7).expect("plan");
    ensure_assigned(paths, &plan).expect("assign");
    (raw, plan)
}

/// Write every group's output, rewriting records through `edit`.
fn transform_all(paths: &ArtifactPaths, plan: &AssignmentPlan, edit: impl Fn(&mut Record)) {
    for group in plan.non_empty() {
        let output: Vec<Record> = group
            .records
            .iter()
            .cloned()
            .map(|mut record| {
                edit(&mut record);
                record
            })
            .collect();
        write_records(&paths.transformed_path(&group.key), &output).expect("write output");
    }
}

fn uppercase(record: &mut Record) {
    for message in &mut record.messages {
        if let Some(text) = message.content.as_str() {
            message.content = json!(text.to_uppercase());
        }
    }
}

#[test]
fn content_rewrites_pass_validation() {
    let original = conversation("s", 0);
    let mut rewritten = original.clone();
    uppercase(&mut rewritten);
    assert!(structural_differences(&original, &rewritten, &[]).is_empty());
}

#[test]
fn structural_changes_are_reported() {
    let original = conversation("s", 0);

    let mut dropped = original.clone();
    dropped.messages.pop();
    let reasons = structural_differences(&original, &dropped, &[]);
    assert_eq!(reasons, vec!["message count changed from 3 to 2"]);

    let mut swapped = original.clone();
    swapped.messages[1].role = Role::Tool;
    assert!(structural_differences(&original, &swapped, &[])[0].contains("role changed"));

    let mut extra_key = original.clone();
    extra_key.messages[2]
        .extra
        .insert("thinking".to_string(), json!("..."));
    assert!(structural_differences(&original, &extra_key, &[])[0].contains("keys changed"));
}

#[test]
fn tool_calls_must_survive_unchanged() {
    let mut original = conversation("s", 0);
    original.messages[2]
        .extra
        .insert("tool_calls".to_string(), json!([{"name": "lookup"}]));
    let mut edited = original.clone();
    edited.messages[2]
        .extra
        .insert("tool_calls".to_string(), json!([{"name": "search"}]));
    let reasons = structural_differences(&original, &edited, &[]);
    assert_eq!(reasons, vec!["message 2: tool_calls changed"]);
}

#[test]
fn required_metadata_presence_is_checked() {
    let original = conversation("s", 0);
    let mut stripped = original.clone();
    stripped.metadata.clear();
    let required = names(&["topic"]);
    assert_eq!(
        structural_differences(&original, &stripped, &required),
        vec!["metadata key \"topic\" was dropped"]
    );
    assert!(structural_differences(&original, &stripped, &[]).is_empty());
}

#[test]
fn identity_problems_are_integrity_errors() {
    let expected: BTreeSet<RecordId> = (0..3).map(|i| conversation("s", i).id()).collect();
    let exact: Vec<Record> = (0..3).map(|i| conversation("s", i)).collect();
    assert!(check_identities("s/train", &expected, &exact).is_ok());

    let duplicated = vec![
        conversation("s", 0),
        conversation("s", 0),
        conversation("s", 1),
        conversation("s", 2),
    ];
    let err = check_identities("s/train", &expected, &duplicated).expect_err("duplicate");
    assert_eq!(err.kind(), "integrity");
    assert!(err.to_string().contains("duplicated s#0"));

    let lossy = vec![conversation("s", 0), conversation("s", 9)];
    let err = check_identities("s/train", &expected, &lossy).expect_err("lost and invented");
    let text = err.to_string();
    assert!(text.contains("unexpected s#9"));
    assert!(text.contains("lost s#1, s#2"));
}

#[test]
fn dropped_message_is_rejected_but_kept_in_merged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let (raw, plan) = prepared(&paths, 12);
    transform_all(&paths, &plan, |record| {
        uppercase(record);
        if record.index == 4 {
            record.messages.pop();
        }
    });

    let report = merge_branch(&paths, &plan, &raw, &[]).expect("merge");
    assert!(report.is_complete());
    assert_eq!(report.merged, 12);
    assert_eq!(report.cleaned, 11);
    assert_eq!(report.rejected(), 1);
    assert_eq!(report.rejections[0].id, "src#4");

    let cleaned = load_records(&paths.cleaned_path(&plan.branch)).expect("cleaned");
    assert!(cleaned.iter().all(|record| record.index != 4));
    let merged = load_records(&paths.merged_path(&plan.branch)).expect("merged");
    assert!(merged.iter().any(|record| record.index == 4));
}

#[test]
fn missing_group_yields_incomplete_merge_that_is_recomputed_later() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let (raw, plan) = prepared(&paths, 12);
    transform_all(&paths, &plan, uppercase);
    let lagging = plan.groups[5].key.clone();
    std::fs::remove_file(paths.transformed_path(&lagging)).expect("remove output");

    let partial = merge_branch(&paths, &plan, &raw, &[]).expect("partial merge");
    assert_eq!(partial.missing_groups, vec![lagging.clone()]);
    assert_eq!(partial.merged, 10);
    assert_eq!(partial.cleaned, 10);

    transform_all(&paths, &plan, uppercase);
    let full = merge_branch(&paths, &plan, &raw, &[]).expect("full merge");
    assert!(full.is_complete());
    assert!(!full.reused);
    assert_eq!(full.cleaned, 12);
}

#[test]
fn complete_artifacts_are_reused_without_rewrites() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let (raw, plan) = prepared(&paths, 7);
    transform_all(&paths, &plan, uppercase);
    merge_branch(&paths, &plan, &raw, &[]).expect("first merge");
    let cleaned_path = paths.cleaned_path(&plan.branch);
    let before = std::fs::read(&cleaned_path).expect("read cleaned");

    let again = merge_branch(&paths, &plan, &raw, &[]).expect("second merge");
    assert!(again.reused);
    assert_eq!(std::fs::read(&cleaned_path).expect("reread cleaned"), before);

    std::fs::write(&cleaned_path, b"{").expect("corrupt cleaned");
    let repaired = merge_branch(&paths, &plan, &raw, &[]).expect("repair");
    assert!(!repaired.reused);
    assert_eq!(std::fs::read(&cleaned_path).expect("repaired cleaned"), before);
}

#[test]
fn duplicated_output_aborts_without_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let (raw, plan) = prepared(&paths, 6);
    transform_all(&paths, &plan, uppercase);
    let first = &plan.groups[0];
    let mut doubled = first.records.clone();
    doubled.extend(first.records.clone());
    write_records(&paths.transformed_path(&first.key), &doubled).expect("write doubled");

    let err = merge_branch(&paths, &plan, &raw, &[]).expect_err("integrity");
    let branch_err = err.downcast_ref::<BranchError>().expect("branch error");
    assert_eq!(branch_err.kind(), "integrity");
    assert!(!paths.merged_path(&plan.branch).exists());
    assert!(!paths.cleaned_path(&plan.branch).exists());
}

fn with_tool_result(index: u64, content: &str) -> Record {
    let mut record = conversation("src", index);
    let mut result = Message::new(Role::Tool, content);
    result.name = Some("lookup".to_string());
    record.messages.push(result);
    record
}

#[test]
fn garbled_tool_results_are_restored_from_the_sample() {
    let original = with_tool_result(0, r#"{"hits": 3}"#);

    let mut garbled = original.clone();
    uppercase(&mut garbled);
    garbled.messages[3].content = json!("three hits were found");
    garbled.messages[3].name = Some("search".to_string());
    assert_eq!(restore_tool_messages(&original, &mut garbled), 1);
    assert_eq!(garbled.messages[3].content, json!(r#"{"hits": 3}"#));
    assert_eq!(garbled.messages[3].name.as_deref(), Some("lookup"));
    assert_eq!(garbled.messages[1].content, json!("QUESTION 0"));

    let mut reformatted = original.clone();
    reformatted.messages[3].content = json!(r#"{"hits":3}"#);
    assert_eq!(restore_tool_messages(&original, &mut reformatted), 0);
    assert_eq!(reformatted.messages[3].content, json!(r#"{"hits":3}"#));

    let plain = with_tool_result(1, "no results");
    let mut rewritten = plain.clone();
    rewritten.messages[3].content = json!("nothing found");
    assert_eq!(restore_tool_messages(&plain, &mut rewritten), 0);
}

#[test]
fn merge_restores_tool_results_before_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let branch = BranchKey::new("src", "train");
    let raw: Vec<Record> = (0..6)
        .map(|index| with_tool_result(index, r#"{"ok": true}"#))
        .collect();
    let combos = combos(&names(&["a"]), &names(&["x", "y"]));
    let plan = plan_assignment(&branch, &raw, &combos, 7).expect("plan");
    ensure_assigned(&paths, &plan).expect("assign");
    transform_all(&paths, &plan, |record| {
        record.messages[3].content = json!("it worked");
        record.messages[3].name = None;
    });

    let report = merge_branch(&paths, &plan, &raw, &[]).expect("merge");
    assert_eq!(report.cleaned, 6);
    let cleaned = load_records(&paths.cleaned_path(&branch)).expect("cleaned");
    assert!(cleaned
        .iter()
        .all(|record| record.messages[3].content == json!(r#"{"ok": true}"#)));
}

#[test]
fn merged_records_carry_their_route_and_ignore_it_when_validating() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::new(dir.path().to_path_buf());
    let (raw, plan) = prepared(&paths, 12);
    transform_all(&paths, &plan, |record| {
        uppercase(record);
        record.metadata.remove(crate::model::ENGINE_KEY);
    });

    let required = names(&["topic", "treatment", "engine"]);
    let report = merge_branch(&paths, &plan, &raw, &required).expect("merge");
    assert_eq!(report.cleaned, 12);
    let cleaned = load_records(&paths.cleaned_path(&plan.branch)).expect("cleaned");
    for group in plan.non_empty() {
        for input in &group.records {
            let record = cleaned
                .iter()
                .find(|record| record.id() == input.id())
                .expect("cleaned record");
            assert_eq!(record.metadata["treatment"], group.key.treatment());
            assert_eq!(record.metadata["engine"], group.key.engine());
            assert_eq!(record.metadata["topic"], "logic");
        }
    }
}

#[test]
fn pending_inputs_cover_missing_and_broken_outputs() {
    let inputs: Vec<Record> = (0..4).map(|index| conversation("s", index)).collect();
    let mut broken = inputs[1].clone();
    broken.messages.pop();
    let mut stray = conversation("s", 9);
    uppercase(&mut stray);
    let outputs = vec![inputs[0].clone(), broken, inputs[3].clone(), stray];

    let pending: Vec<u64> = pending_inputs(&inputs, &outputs, &[])
        .iter()
        .map(|record| record.index)
        .collect();
    assert_eq!(pending, vec![1, 2]);
}
