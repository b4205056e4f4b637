//! Integration coverage for path-set resolution against a real directory tree.

use buildkeep::project_util::TempProject;
use buildkeep::PathSet;

#[test]
fn nested_includes_select_only_matching_subtree() {
    let project = TempProject::new().unwrap();
    project.write_input("src/a.rs", "fn a() {}").unwrap();
    project.write_input("src/nested/b.rs", "fn b() {}").unwrap();
    project.write_input("docs/readme.md", "# hi").unwrap();

    let manager = project.manager();
    let mut ctx = manager.new_context(project.out_dir(), "resolver-test").unwrap();
    let set = PathSet::new(project.in_dir(), ["**/*.rs"], Vec::<String>::new());
    let resolved = ctx.get_inputs(&set).unwrap();

    assert_eq!(resolved.selected.len(), 2);
    assert!(resolved.selected.iter().all(|p| p.extension().unwrap() == "rs"));
}

#[test]
fn excludes_remove_a_subdirectory_from_selection() {
    let project = TempProject::new().unwrap();
    project.write_input("src/a.rs", "fn a() {}").unwrap();
    project.write_input("src/generated/b.rs", "fn b() {}").unwrap();

    let manager = project.manager();
    let mut ctx = manager.new_context(project.out_dir(), "resolver-test").unwrap();
    let set = PathSet::new(project.in_dir(), ["**/*.rs"], ["**/generated/**"]);
    let resolved = ctx.get_inputs(&set).unwrap();

    assert_eq!(resolved.selected.len(), 1);
    assert_eq!(resolved.selected[0].file_name().unwrap(), "a.rs");
}

#[test]
fn resolve_outputs_flags_untracked_files_left_on_disk() {
    let project = TempProject::new().unwrap();
    let a = project.write_input("a.txt", "one").unwrap();

    let manager = project.manager();
    let mut ctx = manager.new_context(project.out_dir(), "resolver-test").unwrap();
    let tracked = project.out_dir().join("a.out");
    ctx.add_output(&a, &tracked).unwrap();
    std::fs::write(&tracked, "one").unwrap();
    std::fs::write(project.out_dir().join("leftover.out"), "stale").unwrap();
    ctx.commit().unwrap();

    let ctx = manager.new_context(project.out_dir(), "resolver-test").unwrap();
    let out_set = PathSet::new(project.out_dir(), Vec::<String>::new(), Vec::<String>::new());
    let scan = ctx.resolve_outputs(&out_set).unwrap();

    assert!(scan.live.contains(&tracked));
    assert!(scan.untracked.contains(&project.out_dir().join("leftover.out")));
}

#[test]
fn empty_project_resolves_to_nothing() {
    let project = TempProject::new().unwrap();
    let manager = project.manager();
    let mut ctx = manager.new_context(project.out_dir(), "resolver-test").unwrap();
    let set = PathSet::new(project.in_dir(), Vec::<String>::new(), Vec::<String>::new());
    let resolved = ctx.get_inputs(&set).unwrap();
    assert!(resolved.selected.is_empty());
    assert!(resolved.deleted.is_empty());
}
