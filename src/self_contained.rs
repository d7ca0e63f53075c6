//! Dependency-closure verification.
//!
//! A dylib is only admitted if every one of its non-weak dependencies is
//! itself admitted, so removal iterates to a fixed point. Dylibs the caller
//! marked required propagate a `MustBeIncludedForDependent` marking over
//! their dependency closure so the front end can report precise errors, and
//! optionally any admitted dylib marked `exclude-if-unused` that nothing
//! else references is dropped too.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::diagnostics::Diagnostics;
use crate::input_gatherer::{ClassifiedInputs, InclusionState, InputFile};

pub fn verify_self_contained(
    classified: &mut ClassifiedInputs,
    inputs: &mut [InputFile],
    evict_unused_leaves: bool,
    sink: &mut Diagnostics,
) {
    // Snapshot the dependency edges up front; everything below works on
    // paths so the image list can be reshuffled at the end.
    struct DylibNode {
        runtime_path: String,
        install_name: String,
        input: Option<usize>,
        deps: Vec<(String, bool)>, // (path, weak)
    }

    let nodes: Vec<DylibNode> = classified
        .dylibs_to_cache
        .iter()
        .map(|dylib| DylibNode {
            runtime_path: dylib.runtime_path.clone(),
            install_name: dylib.install_name().to_owned(),
            input: dylib.input,
            deps: dylib
                .image
                .dependents()
                .into_iter()
                .map(|d| (d.path, d.weak))
                .collect(),
        })
        .collect();

    let mut known: HashSet<String> = HashSet::new();
    for node in &nodes {
        known.insert(node.runtime_path.clone());
        known.insert(node.install_name.clone());
    }

    // Universe of everything we saw, for required-closure marking: path or
    // install name -> input index.
    let mut all_inputs: HashMap<String, Option<usize>> = HashMap::new();
    let mut all_deps: HashMap<String, Vec<(String, bool)>> = HashMap::new();
    for node in &nodes {
        all_inputs.insert(node.runtime_path.clone(), node.input);
        all_inputs.insert(node.install_name.clone(), node.input);
        all_deps.insert(node.runtime_path.clone(), node.deps.clone());
        all_deps.insert(node.install_name.clone(), node.deps.clone());
    }
    for other in &classified.other_dylibs {
        let deps: Vec<(String, bool)> = other
            .image
            .dependents()
            .into_iter()
            .map(|d| (d.path, d.weak))
            .collect();
        all_inputs.insert(other.runtime_path.clone(), other.input);
        all_deps.insert(other.runtime_path.clone(), deps.clone());
        if let Some(name) = other.image.install_name() {
            all_inputs.insert(name.to_owned(), other.input);
            all_deps.insert(name.to_owned(), deps);
        }
    }
    for &index in &classified.could_not_load {
        all_inputs.insert(inputs[index].path.clone(), Some(index));
    }

    let mut bad: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    // Remove any member whose non-weak dependency is not in the admitted
    // set, until nothing changes.
    let mut do_again = true;
    while do_again {
        do_again = false;
        for node in &nodes {
            if bad.contains_key(&node.runtime_path) {
                continue;
            }
            for (dep, weak) in &node.deps {
                if *weak || known.contains(dep) {
                    continue;
                }
                bad.entry(node.runtime_path.clone())
                    .or_default()
                    .insert(format!("Could not find dependency '{dep}'"));
                known.remove(&node.runtime_path);
                known.remove(&node.install_name);
                do_again = true;
            }
        }
    }

    // Walk the dylibs that depend on missing dylibs; if any is required,
    // mark its whole non-weak dependency closure required-for-dependent.
    for runtime_path in bad.keys() {
        let Some(&Some(input_index)) = all_inputs.get(runtime_path) else {
            continue;
        };
        if !inputs[input_index].must_be_included() {
            continue;
        }
        let mut worklist = vec![runtime_path.clone()];
        while let Some(path) = worklist.pop() {
            let Some(deps) = all_deps.get(&path) else {
                continue;
            };
            for (dep, weak) in deps.clone() {
                if weak {
                    continue;
                }
                if let Some(&Some(dep_input)) = all_inputs.get(&dep) {
                    if inputs[dep_input].state == InclusionState::Unset {
                        inputs[dep_input].state = InclusionState::MustBeIncludedForDependent;
                        worklist.push(dep);
                    }
                }
            }
        }
    }

    if evict_unused_leaves {
        let mut do_again = true;
        while do_again {
            do_again = false;

            let mut referenced: HashSet<&str> = HashSet::new();
            for node in &nodes {
                if bad.contains_key(&node.runtime_path) {
                    continue;
                }
                for (dep, _) in &node.deps {
                    referenced.insert(dep);
                }
            }

            for node in &nodes {
                if bad.contains_key(&node.runtime_path) {
                    continue;
                }
                let excludable = node
                    .input
                    .is_some_and(|i| inputs[i].state == InclusionState::MustBeExcludedIfUnused);
                if excludable && !referenced.contains(node.install_name.as_str()) {
                    bad.entry(node.runtime_path.clone())
                        .or_default()
                        .insert("It has been explicitly excluded as it is unused".to_owned());
                    do_again = true;
                }
            }
        }
    }

    // Demote the bad dylibs, with a warning per reason on the owning input.
    let mut keep = Vec::with_capacity(classified.dylibs_to_cache.len());
    for dylib in classified.dylibs_to_cache.drain(..) {
        match bad.get(&dylib.runtime_path) {
            None => keep.push(dylib),
            Some(reasons) => {
                for reason in reasons {
                    let message = format!(
                        "Dylib located at '{}' not placed in shared cache because: {}",
                        dylib.runtime_path, reason
                    );
                    match dylib.input {
                        Some(index) => inputs[index].diag.warning(message),
                        None => sink.warning(message),
                    }
                }
                classified.other_dylibs.push(dylib);
            }
        }
    }
    classified.dylibs_to_cache = keep;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache_format::VmProt;
    use crate::images::{DependentDylib, MachFileKind, MachImage, SegmentInfo};
    use crate::input_gatherer::LoadedImage;

    struct StubImage {
        install_name: String,
        deps: Vec<DependentDylib>,
    }

    impl MachImage for StubImage {
        fn bytes(&self) -> &[u8] {
            &[]
        }
        fn file_kind(&self) -> MachFileKind {
            MachFileKind::Dylib
        }
        fn install_name(&self) -> Option<&str> {
            Some(&self.install_name)
        }
        fn uuid(&self) -> [u8; 16] {
            [0; 16]
        }
        fn segments(&self) -> Vec<SegmentInfo> {
            vec![SegmentInfo {
                name: "__TEXT".into(),
                vm_addr: 0,
                vm_size: 0x1000,
                file_size: 0x1000,
                size_of_sections: 0x1000,
                p2align: 12,
                protections: VmProt::READ | VmProt::EXECUTE,
                index: 0,
            }]
        }
        fn dependents(&self) -> Vec<DependentDylib> {
            self.deps.clone()
        }
        fn section_bytes(&self, _: &str, _: &str) -> Option<&[u8]> {
            None
        }
        fn placeable_in_cache(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn dylib(name: &str, deps: &[(&str, bool)], input: Option<usize>) -> LoadedImage {
        LoadedImage {
            image: Box::new(StubImage {
                install_name: name.to_owned(),
                deps: deps
                    .iter()
                    .map(|&(path, weak)| DependentDylib {
                        path: path.to_owned(),
                        weak,
                        re_export: false,
                        upward: false,
                    })
                    .collect(),
            }),
            runtime_path: name.to_owned(),
            slice_offset: 0,
            mtime: 0,
            inode: 0,
            input,
        }
    }

    #[test]
    fn missing_dependency_demotes_transitively() {
        let mut classified = ClassifiedInputs::default();
        // c -> b -> a -> (missing)
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/a.dylib", &[("/usr/lib/missing.dylib", false)], None));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/b.dylib", &[("/usr/lib/a.dylib", false)], None));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/c.dylib", &[("/usr/lib/b.dylib", true)], None));

        let mut sink = Diagnostics::default();
        verify_self_contained(&mut classified, &mut [], false, &mut sink);

        // a and b fall out; c only weakly depends on b and stays.
        assert_eq!(classified.dylibs_to_cache.len(), 1);
        assert_eq!(classified.dylibs_to_cache[0].runtime_path, "/usr/lib/c.dylib");
        assert_eq!(classified.other_dylibs.len(), 2);
        assert!(
            sink.warnings()
                .iter()
                .any(|w| w.contains("Could not find dependency '/usr/lib/missing.dylib'"))
        );
    }

    #[test]
    fn unused_leaf_marked_excludable_is_removed() {
        let mut classified = ClassifiedInputs::default();
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/used.dylib", &[], Some(0)));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/uses.dylib", &[("/usr/lib/used.dylib", false)], Some(1)));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/leaf.dylib", &[], Some(2)));

        let mut inputs = [
            InputFile::new("/usr/lib/used.dylib"),
            InputFile::new("/usr/lib/uses.dylib"),
            InputFile::with_state("/usr/lib/leaf.dylib", InclusionState::MustBeExcludedIfUnused),
        ];
        let mut sink = Diagnostics::default();
        verify_self_contained(&mut classified, &mut inputs, true, &mut sink);

        assert_eq!(classified.dylibs_to_cache.len(), 2);
        assert!(
            !classified
                .dylibs_to_cache
                .iter()
                .any(|d| d.runtime_path == "/usr/lib/leaf.dylib")
        );
        assert!(
            inputs[2]
                .diag
                .warnings()
                .iter()
                .any(|w| w.contains("explicitly excluded as it is unused"))
        );
    }

    #[test]
    fn required_dylib_marks_dependency_closure() {
        let mut classified = ClassifiedInputs::default();
        classified.dylibs_to_cache.push(dylib(
            "/usr/lib/root.dylib",
            &[("/usr/lib/mid.dylib", false), ("/usr/lib/missing.dylib", false)],
            Some(0),
        ));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/mid.dylib", &[("/usr/lib/deep.dylib", false)], Some(1)));
        classified
            .dylibs_to_cache
            .push(dylib("/usr/lib/deep.dylib", &[], Some(2)));

        let mut inputs = [
            InputFile::with_state("/usr/lib/root.dylib", InclusionState::MustBeIncluded),
            InputFile::new("/usr/lib/mid.dylib"),
            InputFile::new("/usr/lib/deep.dylib"),
        ];
        let mut sink = Diagnostics::default();
        verify_self_contained(&mut classified, &mut inputs, false, &mut sink);

        assert_eq!(inputs[1].state, InclusionState::MustBeIncludedForDependent);
        assert_eq!(inputs[2].state, InclusionState::MustBeIncludedForDependent);
    }
}
