use crate::common::{DIAMOND, SyncMode, TestWorkspace};
use lsp_types::{Position, Range};
use mro_lens::editor::execute_lens_command;
use mro_lens::lsp::types::{SHOW_MRO_COMMAND, chain_from_hover, chain_from_lens};
use serial_test::serial;

fn chains(classes: &[mro_lens::ClassLens]) -> Vec<Vec<String>> {
    classes.iter().map(|class| class.chain.clone()).collect()
}

#[tokio::test]
#[serial]
async fn test_diamond_lenses_in_source_order() {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).build().await;
    let path = ws.apath("diamond.py");

    let lenses = ws.providers.class_lenses(&path).await;
    let starts: Vec<Position> = lenses.iter().map(|lens| lens.range.start).collect();
    assert_eq!(
        starts,
        vec![
            Position::new(7, 6),
            Position::new(13, 6),
            Position::new(19, 6),
            Position::new(25, 6),
        ]
    );
    assert_eq!(
        lenses[0].range,
        Range::new(Position::new(7, 6), Position::new(7, 7))
    );

    let classes = ws.providers.class_chains(&path).await;
    assert_eq!(
        chains(&classes),
        vec![
            vec!["A", "Generic", "object"],
            vec!["B", "A", "Generic", "object"],
            vec!["C", "A", "Generic", "object"],
            vec!["D", "B", "C", "A", "Generic", "object"],
        ]
    );
    assert_eq!(classes[3].start, (26, 7));

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_resolved_lens_carries_show_mro_command() {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).build().await;
    let path = ws.apath("diamond.py");

    let lens = ws.providers.class_lenses(&path).await.remove(3);
    assert!(lens.command.is_none());

    let resolved = ws.providers.resolve(lens).await;
    let command = resolved.command.as_ref().unwrap();
    assert_eq!(command.command, SHOW_MRO_COMMAND);
    assert_eq!(command.title, "Show MRO list");
    assert_eq!(
        chain_from_lens(&resolved).unwrap(),
        vec!["D", "B", "C", "A", "Generic", "object"]
    );

    let notification = execute_lens_command(&resolved).unwrap();
    assert_eq!(notification.message, "D\nB\nC\nA\nGeneric\nobject");

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_hover_on_name_matches_lens() {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).build().await;
    let path = ws.apath("diamond.py");

    let classes = ws.providers.class_chains(&path).await;
    for class in &classes {
        let (line, column) = class.start;
        assert_eq!(
            ws.providers.hover_chain(&path, line, column).await,
            class.chain,
            "hover at {line}:{column}"
        );
    }

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_hover_off_name_is_empty() {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).build().await;
    let path = ws.apath("diamond.py");

    // `class` keyword of A
    assert!(ws.providers.hover_chain(&path, 8, 1).await.is_empty());
    // `Generic` in A's base list
    assert!(ws.providers.hover_chain(&path, 8, 9).await.is_empty());
    // `B` in D's base list
    assert!(ws.providers.hover_chain(&path, 26, 9).await.is_empty());
    // method body
    assert!(ws.providers.hover_chain(&path, 11, 9).await.is_empty());
    // class word inside a comment
    assert!(ws.providers.hover_chain(&path, 5, 27).await.is_empty());

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_hover_at_cursor() {
    let fixture = r#"#- shapes.py
class Shape:
    pass


class Sq$0uare(Shape):
    pass
"#;
    let mut ws = TestWorkspace::builder().fixture(fixture).build().await;
    let (path, line, column) = ws.cursor();

    assert_eq!(
        ws.providers.hover_chain(&path, line, column).await,
        vec!["Square", "Shape", "object"]
    );

    let client = ws.providers.client();
    let uri = client.sync_file(&path).await.unwrap();
    let hover = client
        .hover(&uri, Position::new(line - 1, column - 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hover.range, Some(Range::new(Position::new(4, 6), Position::new(4, 12))));
    assert_eq!(chain_from_hover(&hover), vec!["Square", "Shape", "object"]);

    ws.session.deactivate().await;
}

async fn appended_class_scenario(sync: SyncMode) {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).sync(sync).build().await;
    let path = ws.apath("diamond.py");

    let before = ws.providers.class_chains(&path).await;
    assert_eq!(before.len(), 4);

    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("\n\nclass E(D):\n    pass\n");
    ws.write("diamond.py", &content);

    let after = ws.providers.class_chains(&path).await;
    assert_eq!(after.len(), 5);
    assert_eq!(&after[..4], &before[..]);
    assert_eq!(
        after[4].chain,
        vec!["E", "D", "B", "C", "A", "Generic", "object"]
    );
    assert!(after[3].range.start < after[4].range.start);

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_appended_class_incremental_sync() {
    appended_class_scenario(SyncMode::Incremental).await;
}

#[tokio::test]
#[serial]
async fn test_appended_class_full_sync() {
    appended_class_scenario(SyncMode::Full).await;
}

#[tokio::test]
#[serial]
async fn test_class_word_in_comments_and_strings_ignored() {
    let fixture = r#"#- comments.py
"""
class Ignore(ABC):
    pass
"""
from abc import ABC, abstractmethod  # class Ignore: pass


class DefinitionInComments(
    ABC  # class Ignore(ABC): pass
):
    STATIC_VAL = 'class Ignore: pass'

    def method(self):
        class_def = "class Ignore: pass"
        return class_def  # class Ignore: pass


class MultiLineDef(  # unnecessary class word
    DefinitionInComments,
):
    pass
"#;
    let mut ws = TestWorkspace::builder().fixture(fixture).build().await;
    let path = ws.apath("comments.py");

    let classes = ws.providers.class_chains(&path).await;
    assert_eq!(
        chains(&classes),
        vec![
            vec!["DefinitionInComments", "ABC", "object"],
            vec!["MultiLineDef", "DefinitionInComments", "ABC", "object"],
        ]
    );

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_inconsistent_hierarchy_truncates_chain() {
    let fixture = r#"#- conflict.py
class O: pass

class A(O): pass

class B(A): pass

class C(A, B): pass
"#;
    let mut ws = TestWorkspace::builder().fixture(fixture).build().await;
    let path = ws.apath("conflict.py");

    let classes = ws.providers.class_chains(&path).await;
    assert_eq!(classes.len(), 4);
    assert_eq!(classes[2].chain, vec!["B", "A", "O", "object"]);
    assert_eq!(classes[3].chain, vec!["C"]);

    ws.session.deactivate().await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_requests_matched_to_their_answers() {
    let mut ws = TestWorkspace::builder().fixture(DIAMOND).build().await;
    let path = ws.apath("diamond.py");
    let client = ws.providers.client().clone();
    let uri = client.sync_file(&path).await.unwrap();

    let lines = [7u32, 13, 19, 25, 7, 25, 13, 19];
    let hovers = futures::future::join_all(
        lines
            .iter()
            .map(|line| client.hover(&uri, Position::new(*line, 6))),
    )
    .await;

    let heads: Vec<String> = hovers
        .into_iter()
        .map(|hover| chain_from_hover(&hover.unwrap().unwrap())[0].clone())
        .collect();
    assert_eq!(heads, vec!["A", "B", "C", "D", "A", "D", "B", "C"]);
    assert_eq!(client.pending_requests(), 0);

    ws.session.deactivate().await;
}
