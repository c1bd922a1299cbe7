//! Lifecycle coverage: chains, cascades, slot accounting and refcount
//! discipline, driven end to end against the real engine.
//!
//! The slot tables are process-wide, so every test here takes the serial
//! guard; assertions on table occupancy would otherwise race tests
//! running on sibling threads.

use std::sync::{Mutex, MutexGuard};

use kestrel_bridge::{
    context_slot_stats, engine_slot_stats, BridgeError, Engine, FieldKey, IoSpec, TraitFlags,
    ValueTag,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn engine_with(source: &str) -> Engine {
    let engine = Engine::open(kestrel_vm::library()).unwrap();
    engine.parse_text(source).unwrap();
    engine
}

#[test]
fn value_chain_empties_after_explicit_closes() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    assert_eq!(ctx.value_count(), 0);

    let a = ctx.new_int(7).unwrap();
    let b = ctx.new_str("tag").unwrap();
    assert_eq!(ctx.value_count(), 2);

    a.close();
    b.close();
    assert_eq!(ctx.value_count(), 0);
    ctx.close();
    engine.close();
}

#[test]
fn closing_a_context_closes_exactly_its_values() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let values: Vec<_> = (0..5).map(|i| ctx.new_int(i).unwrap()).collect();
    assert_eq!(ctx.value_count(), 5);

    ctx.close();
    assert_eq!(ctx.value_count(), 0);
    for value in values {
        assert!(matches!(value.to_int(), Err(BridgeError::Closed)));
    }
    engine.close();
}

#[test]
fn call_returns_the_incremented_value() {
    let _guard = serial();
    let engine = engine_with("function f(a){ return a+1 }\nreturn 0;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();

    let arg = ctx.new_int(41).unwrap();
    let out = ctx.call("f", &[&arg]).unwrap();
    assert_eq!(out.to_int().unwrap(), 42);

    // The argument kept its unit through the call.
    assert_eq!(arg.to_int().unwrap(), 41);
    out.close();
    arg.close();
    assert_eq!(ctx.value_count(), 0);
    ctx.close();
    engine.close();
}

#[test]
fn double_close_is_safe_at_every_level() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let value = ctx.new_int(1).unwrap();

    value.close();
    value.close();
    ctx.close();
    ctx.close();
    engine.close();
    engine.close();

    assert!(matches!(value.to_int(), Err(BridgeError::Closed)));
    assert!(matches!(ctx.exec(&[]), Err(BridgeError::Closed)));
    assert!(matches!(engine.parse_text("return 2;"), Err(BridgeError::Closed)));
}

#[test]
fn engine_close_sweeps_live_contexts() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let c1 = engine.new_context(1, IoSpec::default()).unwrap();
    let c2 = engine.new_context(2, IoSpec::default()).unwrap();
    let leftover = c1.new_int(9).unwrap();
    assert_eq!(engine.context_count(), 2);

    engine.close();
    assert_eq!(engine.context_count(), 0);
    assert!(matches!(c1.exec(&[]), Err(BridgeError::Closed)));
    assert!(matches!(c2.exec(&[]), Err(BridgeError::Closed)));
    assert!(matches!(leftover.to_int(), Err(BridgeError::Closed)));
    assert!(matches!(
        engine.new_context(3, IoSpec::default()),
        Err(BridgeError::Closed)
    ));
}

#[test]
fn context_slots_are_reused_most_recently_freed_first() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let slot = ctx.slot_id();
    ctx.close();

    let replacement = engine.new_context(2, IoSpec::default()).unwrap();
    assert_eq!(replacement.slot_id(), slot);
    replacement.close();
    engine.close();
}

#[test]
fn concurrent_contexts_stay_within_peak_slot_growth() {
    let _guard = serial();
    const K: usize = 8;
    let before = context_slot_stats();

    let engine = Engine::open(kestrel_vm::library()).unwrap();
    let seed_idx = engine.add_global("SEED").unwrap();
    engine.parse_text("return SEED * 2;").unwrap();

    std::thread::scope(|scope| {
        for i in 0..K {
            let engine = engine.clone();
            scope.spawn(move || {
                let ctx = engine.new_context(i as u64, IoSpec::default()).unwrap();
                let seed = ctx.new_int(i as i64).unwrap();
                ctx.set_global(seed_idx, &seed).unwrap();
                seed.close();

                let out = ctx.exec(&[]).unwrap();
                assert_eq!(out.to_int().unwrap(), i as i64 * 2);
                out.close();
                assert_eq!(ctx.value_count(), 0);
                ctx.close();
            });
        }
    });

    assert_eq!(engine.context_count(), 0);
    let after = context_slot_stats();
    assert_eq!(after.held, before.held);
    assert!(
        after.capacity <= before.capacity + K,
        "table grew past peak occupancy: {} -> {}",
        before.capacity,
        after.capacity
    );
    engine.close();
}

#[test]
fn dropping_the_last_wrapper_tears_everything_down() {
    let _guard = serial();
    let engines_before = engine_slot_stats();
    let contexts_before = context_slot_stats();

    {
        let engine = engine_with("return 1;");
        let ctx = engine.new_context(1, IoSpec::default()).unwrap();
        let _orphan = ctx.new_int(5).unwrap();
        // No explicit closes: the engine wrapper's drop must cascade.
    }

    assert_eq!(engine_slot_stats().held, engines_before.held);
    assert_eq!(context_slot_stats().held, contexts_before.held);
}

#[test]
fn parse_failure_is_inspectable_and_the_engine_stays_usable() {
    let _guard = serial();
    let engine = Engine::open(kestrel_vm::library()).unwrap();
    let err = engine.parse_text("return (;").unwrap_err();
    match err {
        BridgeError::Script(script) => {
            assert_eq!(script.line, 1);
            assert!(!script.msg.is_empty());
        }
        other => panic!("expected script error, got {other}"),
    }

    engine.parse_text("return 5;").unwrap();
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let out = ctx.exec(&[]).unwrap();
    assert_eq!(out.to_int().unwrap(), 5);
    out.close();
    ctx.close();
    engine.close();
}

#[test]
fn runtime_failure_reports_the_script_location() {
    let _guard = serial();
    let engine = engine_with("x = 1;\nreturn 1/0;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let err = ctx.exec(&[]).unwrap_err();
    match err {
        BridgeError::Script(script) => {
            assert_eq!(script.msg, "division by zero");
            assert_eq!(script.line, 2);
            assert_eq!(script.file, "(script)");
        }
        other => panic!("expected script error, got {other}"),
    }
    ctx.close();
    engine.close();
}

#[test]
fn global_bindings_outlive_the_wrapper_that_set_them() {
    let _guard = serial();
    let engine = Engine::open(kestrel_vm::library()).unwrap();
    let idx = engine.add_global("BASE").unwrap();
    engine.parse_text("return BASE + 1;").unwrap();
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();

    let base = ctx.new_int(41).unwrap();
    ctx.set_global(idx, &base).unwrap();
    // The wrapper keeps its own unit through the store.
    assert_eq!(base.to_int().unwrap(), 41);
    base.close();

    let out = ctx.exec(&[]).unwrap();
    assert_eq!(out.to_int().unwrap(), 42);
    out.close();
    assert_eq!(ctx.value_count(), 0);
    ctx.close();
    engine.close();
}

#[test]
fn values_from_another_context_are_rejected() {
    let _guard = serial();
    let engine = engine_with("function id(x){ return x }\nreturn 0;");
    let c1 = engine.new_context(1, IoSpec::default()).unwrap();
    let c2 = engine.new_context(2, IoSpec::default()).unwrap();

    let stray = c1.new_int(5).unwrap();
    assert!(matches!(
        c2.call("id", &[&stray]),
        Err(BridgeError::ForeignValue)
    ));

    stray.close();
    c1.close();
    c2.close();
    engine.close();
}

#[test]
fn containers_round_trip_elements_and_iterate_in_order() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();

    let arr = ctx.new_arr(2).unwrap();
    let ten = ctx.new_int(10).unwrap();
    arr.set_index(0, &ten).unwrap();
    ten.close();
    let thirty = ctx.new_int(30).unwrap();
    arr.set_index(2, &thirty).unwrap();
    thirty.close();

    assert_eq!(arr.len().unwrap(), 2);
    let got = arr.index(2).unwrap();
    assert_eq!(got.to_int().unwrap(), 30);
    got.close();

    let mut walked = Vec::new();
    for entry in arr.fields() {
        let (key, value) = entry.unwrap();
        walked.push((key, value.to_int().unwrap()));
        value.close();
    }
    assert_eq!(
        walked,
        vec![(FieldKey::Index(0), 10), (FieldKey::Index(2), 30)]
    );
    arr.close();

    let map = ctx.new_map().unwrap();
    let label = ctx.new_str("ready").unwrap();
    map.set_key("state", &label).unwrap();
    label.close();
    let field = map.key("state").unwrap();
    assert_eq!(field.to_str().unwrap(), "ready");
    field.close();
    assert_eq!(map.len().unwrap(), 1);
    map.close();

    assert_eq!(ctx.value_count(), 0);
    ctx.close();
    engine.close();
}

#[test]
fn named_vars_surface_as_chained_values() {
    let _guard = serial();
    let engine = engine_with("hits = 3; label = \"x\"; return 0;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let out = ctx.exec(&[]).unwrap();
    out.close();

    let vars = ctx.named_vars().unwrap();
    let names: Vec<&str> = vars.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["hits", "label"]);
    for (name, value) in vars {
        match name.as_str() {
            "hits" => assert_eq!(value.to_int().unwrap(), 3),
            _ => assert_eq!(value.to_str().unwrap(), "x"),
        }
        value.close();
    }

    assert_eq!(ctx.value_count(), 0);
    ctx.close();
    engine.close();
}

#[test]
fn trait_flags_change_evaluation() {
    let _guard = serial();
    let engine = engine_with("return 7/2;");
    engine.set_trait_flags(TraitFlags::FLOAT_DIV).unwrap();
    assert!(engine.trait_flags().unwrap().contains(TraitFlags::FLOAT_DIV));

    let ctx = engine.new_context(1, IoSpec::default()).unwrap();
    let out = ctx.exec(&[]).unwrap();
    assert_eq!(out.to_flt().unwrap(), 3.5);
    out.close();
    ctx.close();
    engine.close();
}

#[test]
fn num_or_str_conversion_picks_the_narrowest_type() {
    let _guard = serial();
    let engine = engine_with("return 1;");
    let ctx = engine.new_context(1, IoSpec::default()).unwrap();

    let int = ctx.new_num_or_str("42").unwrap();
    assert!(matches!(int.tag().unwrap(), ValueTag::Int));
    assert_eq!(int.to_int().unwrap(), 42);
    int.close();

    let flt = ctx.new_num_or_str("2.5").unwrap();
    assert!(matches!(flt.tag().unwrap(), ValueTag::Flt));
    flt.close();

    let text = ctx.new_num_or_str("x7").unwrap();
    assert!(matches!(text.tag().unwrap(), ValueTag::Str));
    assert_eq!(text.to_str().unwrap(), "x7");
    text.close();

    ctx.close();
    engine.close();
}
