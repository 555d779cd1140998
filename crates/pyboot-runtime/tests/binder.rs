mod support;

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

use pyboot_abi::RuntimeVersion;
use pyboot_runtime::{BindError, BoundLibrary, PythonApi, REQUIRED_SYMBOLS};
use support::FakeLibrary;

const V312: RuntimeVersion = RuntimeVersion::new(3, 12);

fn bind_without(missing: &[&'static str]) -> (Result<BoundLibrary<FakeLibrary>, BindError>, usize) {
    let closed = Rc::new(Cell::new(0));
    let library = FakeLibrary::without(missing, closed.clone());
    let result = BoundLibrary::bind(library, Path::new("/opt/app/libpython3.12.so.1.0"), V312);
    let closed_after_bind = closed.get();
    (result, closed_after_bind)
}

fn assert_missing(missing: &[&'static str]) {
    let (result, closed) = bind_without(missing);
    let Err(BindError::MissingSymbols { path, names }) = result else {
        panic!("binding without {missing:?} must fail");
    };
    assert_eq!(closed, 1, "library must be closed when binding fails");
    assert_eq!(path, Path::new("/opt/app/libpython3.12.so.1.0"));

    let expected: Vec<&str> = REQUIRED_SYMBOLS
        .iter()
        .copied()
        .filter(|name| missing.contains(name))
        .collect();
    assert_eq!(names, expected);
}

#[test]
fn complete_library_binds_and_stays_open() {
    let closed = Rc::new(Cell::new(0));
    let library = FakeLibrary::exporting(REQUIRED_SYMBOLS, closed.clone());
    let bound = BoundLibrary::bind(library, Path::new("libpython3.12.so"), V312).unwrap();
    assert_eq!(bound.version(), V312);
    assert_eq!(bound.path(), Path::new("libpython3.12.so"));
    assert_eq!(closed.get(), 0);

    drop(bound);
    assert_eq!(closed.get(), 1);
}

#[test]
fn each_missing_symbol_fails_the_bind() {
    for name in REQUIRED_SYMBOLS {
        assert_missing(&[*name]);
    }
}

#[test]
fn every_pair_of_missing_symbols_is_reported() {
    for (i, first) in REQUIRED_SYMBOLS.iter().enumerate() {
        for second in &REQUIRED_SYMBOLS[i + 1..] {
            assert_missing(&[*first, *second]);
        }
    }
}

#[test]
fn larger_missing_subsets_are_reported_in_table_order() {
    // Deterministic pseudo-random subsets.
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    for _ in 0..200 {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let mask = state >> 16;
        let missing: Vec<&'static str> = REQUIRED_SYMBOLS
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect();
        if missing.is_empty() {
            continue;
        }
        assert_missing(&missing);
    }
    assert_missing(REQUIRED_SYMBOLS);
}

#[test]
fn required_symbols_are_unique() {
    let mut names = REQUIRED_SYMBOLS.to_vec();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), REQUIRED_SYMBOLS.len());
    assert!(REQUIRED_SYMBOLS.contains(&"Py_InitializeFromConfig"));
    assert!(REQUIRED_SYMBOLS.contains(&"PyConfig_SetWideStringList"));
}

#[test]
fn missing_symbol_error_is_one_line_naming_each_symbol() {
    let (result, _) = bind_without(&["PyConfig_SetBytesString", "PyMarshal_ReadObjectFromString"]);
    let message = result.err().unwrap().to_string();
    assert_eq!(
        message,
        "python library /opt/app/libpython3.12.so.1.0 is missing required symbols: \
         PyConfig_SetBytesString, PyMarshal_ReadObjectFromString"
    );
    assert!(!message.contains('\n'));
}

#[test]
fn unopenable_library_is_an_open_error() {
    let dir = support::create_temp_dir("pyboot_binder");
    let path = dir.join("libpython-missing.so");
    let err = match BoundLibrary::load(&path, V312) {
        Err(err) => err,
        Ok(_) => panic!("loading a nonexistent library must fail"),
    };
    assert!(matches!(err, BindError::Open { .. }), "{err}");
    assert!(err.to_string().contains("libpython-missing.so"), "{err}");
    support::rm_rf(&dir);
}
