#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use graphpack::{
    CancellationFlag, ClassType, GraphInspector, GraphPack, GraphPackError, LoadOptions, Name, Object, ObjectPtr,
    SaveFormat, SaveOptions, TypeRegistry, Value, ValueKind,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn node_class() -> Arc<ClassType> {
    ClassType::builder("Node")
        .property("value", ValueKind::Int)
        .property("label", ValueKind::Text)
        .property("next", ValueKind::Object)
        .build()
}

fn registry_of(classes: &[&Arc<ClassType>]) -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    for class in classes {
        registry.register(Arc::clone(class));
    }
    registry
}

fn write(roots: &[ObjectPtr], options: &SaveOptions) -> graphpack::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    GraphPack::write(&mut bytes, roots, options)?;
    Ok(bytes)
}

fn same(a: &Option<ObjectPtr>, b: &ObjectPtr) -> bool {
    a.as_ref().is_some_and(|a| Arc::ptr_eq(a, b))
}

/// Root with value 42 and a child labelled "hello": two exports, parents 0 and 1.
#[test]
fn parent_and_child_round_trip() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    root.set("value", Value::Int(42))?;
    let child = Object::new_child(&class, &root);
    child.set("label", Value::Text("hello".into()))?;

    let bytes = write(&[root, child], &SaveOptions::default())?;

    let report = GraphInspector::inspect_bytes(bytes.clone())?;
    assert_eq!(report.exports.len(), 2);
    assert_eq!(report.exports[0].parent, 0);
    assert_eq!(report.exports[1].parent, 1);
    assert!(report.exports.iter().all(|e| e.crc_ok == Some(true)));

    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default())?;
    assert_eq!(loaded.objects.len(), 2);
    assert_eq!(loaded.roots.len(), 1);

    let (root, child) = (&loaded.objects[0], &loaded.objects[1]);
    assert_eq!(root.get("value"), Some(Value::Int(42)));
    assert_eq!(child.get("label"), Some(Value::Text("hello".into())));
    assert!(same(&child.parent(), root));
    assert!(root.parent().is_none());
    Ok(())
}

#[test]
fn saving_twice_is_byte_identical() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    let a = Object::new_child(&class, &root);
    let b = Object::new_child(&class, &a);
    root.set("next", Value::Object(Some(b.clone())))?;
    b.set("next", Value::Object(Some(a.clone())))?;
    a.set("label", Value::Text("a".into()))?;

    for format in [SaveFormat::Protected, SaveFormat::Unprotected] {
        let options = SaveOptions::new().format(format);
        let first = write(std::slice::from_ref(&root), &options)?;
        let second = write(std::slice::from_ref(&root), &options)?;
        assert_eq!(first, second, "{format:?}");
    }
    Ok(())
}

#[test]
fn cycles_and_pointers_are_restored() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    let a = Object::new_child(&class, &root);
    let b = Object::new_child(&class, &root);
    root.set("next", Value::Object(Some(a.clone())))?;
    a.set("next", Value::Object(Some(b.clone())))?;
    b.set("next", Value::Object(Some(a.clone())))?;
    b.set("value", Value::Int(7))?;

    let bytes = write(std::slice::from_ref(&root), &SaveOptions::default())?;
    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default())?;
    assert_eq!(loaded.objects.len(), 3);

    let next = |o: &ObjectPtr| match o.get("next") {
        Some(Value::Object(Some(target))) => Some(target),
        _ => None,
    };
    let root = &loaded.roots[0];
    let a = next(root).ok_or_else(|| GraphPackError::Internal("root.next is null".into()))?;
    let b = next(&a).ok_or_else(|| GraphPackError::Internal("a.next is null".into()))?;
    assert_eq!(b.get("value"), Some(Value::Int(7)));
    assert!(next(&b).is_some_and(|back| Arc::ptr_eq(&back, &a)));
    assert!(same(&b.parent(), root));
    Ok(())
}

#[test]
fn pointer_outside_roots_loads_as_null() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    let stranger = Object::new(&class);
    stranger.set("value", Value::Int(99))?;
    root.set("next", Value::Object(Some(stranger)))?;

    let bytes = write(std::slice::from_ref(&root), &SaveOptions::default())?;
    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default())?;
    assert_eq!(loaded.objects.len(), 1);
    assert_eq!(loaded.objects[0].get("next"), Some(Value::Object(None)));
    Ok(())
}

#[test]
fn random_hierarchy_round_trip() -> graphpack::Result<()> {
    let class = ClassType::builder("Item")
        .property("id", ValueKind::Int)
        .property("weight", ValueKind::Float)
        .property("link", ValueKind::Object)
        .build();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let mut objects: Vec<ObjectPtr> = vec![Object::new(&class)];
    let mut parents = vec![None];
    for i in 1..500 {
        let parent = rng.gen_range(0..i);
        objects.push(Object::new_child(&class, &objects[parent]));
        parents.push(Some(parent as i64));
    }
    let mut links = Vec::new();
    for (i, object) in objects.iter().enumerate() {
        let link = rng.gen_range(0..objects.len());
        object.set("id", Value::Int(i as i64))?;
        object.set("weight", Value::Float(i as f64 * 0.5))?;
        object.set("link", Value::Object(Some(objects[link].clone())))?;
        links.push(link as i64);
    }

    // Hand the roots over in random order so the saver has to restore parent-first order.
    let mut shuffled = objects.clone();
    shuffled.shuffle(&mut rng);
    let bytes = write(&shuffled, &SaveOptions::default())?;

    let report = GraphInspector::inspect_bytes(bytes.clone())?;
    assert_eq!(report.exports.len(), 500);
    for (i, export) in report.exports.iter().enumerate() {
        assert!(export.parent as usize <= i, "export {i} has later parent {}", export.parent);
    }
    assert_eq!(report.exports.iter().filter(|e| e.parent == 0).count(), 1);

    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default())?;
    assert_eq!(loaded.objects.len(), 500);
    assert_eq!(loaded.roots.len(), 1);

    let id = |o: &ObjectPtr| match o.get("id") {
        Some(Value::Int(id)) => id,
        _ => -1,
    };
    let by_id: HashMap<i64, &ObjectPtr> = loaded.objects.iter().map(|o| (id(o), o)).collect();
    assert_eq!(by_id.len(), 500);

    for (i, parent) in parents.iter().enumerate() {
        let object = by_id[&(i as i64)];
        assert_eq!(object.parent().map(|p| id(&p)), *parent);
        assert_eq!(object.get("weight"), Some(Value::Float(i as f64 * 0.5)));
        let Some(Value::Object(Some(target))) = object.get("link") else {
            return Err(GraphPackError::Internal(format!("object {i} lost its link")));
        };
        assert_eq!(id(&target), links[i]);
    }
    Ok(())
}

#[test]
fn tables_are_deduplicated() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    let children: Vec<ObjectPtr> = (0..100).map(|_| Object::new_child(&class, &root)).collect();
    let mut roots = vec![root];
    roots.extend(children);

    let report = GraphInspector::inspect_bytes(write(&roots, &SaveOptions::default())?)?;
    assert_eq!(report.exports.len(), 101);
    assert_eq!(report.property_count, 3);
    // Node, int, text, ptr
    assert_eq!(report.type_count, 4);
    // Node, value, label, next, int, text, ptr
    assert_eq!(report.name_count, 7);
    Ok(())
}

#[test]
fn every_value_kind_round_trips() -> graphpack::Result<()> {
    let class = ClassType::builder("Everything")
        .property("flag", ValueKind::Bool)
        .property("count", ValueKind::Int)
        .property("ratio", ValueKind::Float)
        .property("text", ValueKind::Text)
        .property("tag", ValueKind::Name)
        .property("blob", ValueKind::Bytes)
        .property("numbers", ValueKind::Array(Box::new(ValueKind::Int)))
        .property("tags", ValueKind::Array(Box::new(ValueKind::Name)))
        .build();
    let object = Object::new(&class);
    let values = [
        ("flag", Value::Bool(true)),
        ("count", Value::Int(-5)),
        ("ratio", Value::Float(2.5)),
        ("text", Value::Text("ünïcode".into())),
        ("tag", Value::Name(Name::from("Shared"))),
        ("blob", Value::Bytes(vec![0, 1, 2, 255])),
        ("numbers", Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
        (
            "tags",
            Value::Array(vec![Value::Name(Name::from("Shared")), Value::Name(Name::from("Other"))]),
        ),
    ];
    for (property, value) in &values {
        object.set(property, value.clone())?;
    }

    for format in [SaveFormat::Protected, SaveFormat::Unprotected] {
        let bytes = write(std::slice::from_ref(&object), &SaveOptions::new().format(format))?;
        let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default())?;
        for (property, value) in &values {
            assert_eq!(loaded.objects[0].get(property).as_ref(), Some(value), "{format:?} {property}");
        }
    }
    Ok(())
}

#[test]
fn changed_schema_skips_stale_properties() -> graphpack::Result<()> {
    let v1 = ClassType::builder("Config")
        .property("kept", ValueKind::Int)
        .property("removed", ValueKind::Text)
        .property("retyped", ValueKind::Int)
        .build();
    let object = Object::new(&v1);
    object.set("kept", Value::Int(1))?;
    object.set("removed", Value::Text("gone".into()))?;
    object.set("retyped", Value::Int(3))?;

    let v2 = ClassType::builder("Config")
        .property("added", ValueKind::Bool)
        .property("retyped", ValueKind::Text)
        .property("kept", ValueKind::Int)
        .build();

    for format in [SaveFormat::Protected, SaveFormat::Unprotected] {
        let bytes = write(std::slice::from_ref(&object), &SaveOptions::new().format(format))?;
        let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&v2]), &LoadOptions::default())?;
        let config = &loaded.objects[0];
        assert_eq!(config.get("kept"), Some(Value::Int(1)));
        assert_eq!(config.get("retyped"), Some(Value::Text(String::new())));
        assert_eq!(config.get("added"), Some(Value::Bool(false)));
        assert_eq!(config.get("removed"), None);
    }
    Ok(())
}

#[test]
fn unknown_and_abstract_classes_are_skipped_with_their_children() -> graphpack::Result<()> {
    let node = node_class();
    let base = ClassType::builder("Base").property("value", ValueKind::Int).build();
    let gone = ClassType::builder("Gone").build();

    let root = Object::new(&node);
    let abstract_child = Object::new_child(&base, &root);
    let below_abstract = Object::new_child(&node, &abstract_child);
    let unknown_child = Object::new_child(&gone, &root);
    let kept = Object::new_child(&node, &root);
    kept.set("next", Value::Object(Some(below_abstract.clone())))?;
    let roots = [root, abstract_child, below_abstract, unknown_child, kept];

    let abstract_base = ClassType::builder("Base")
        .property("value", ValueKind::Int)
        .abstract_class()
        .build();
    let bytes = write(&roots, &SaveOptions::default())?;
    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&node, &abstract_base]), &LoadOptions::default())?;

    assert_eq!(loaded.skipped, 3);
    assert_eq!(loaded.objects.len(), 2);
    let kept = &loaded.objects[1];
    assert_eq!(kept.get("next"), Some(Value::Object(None)));
    Ok(())
}

#[test]
fn post_load_runs_once_per_object_and_main_export_gets_the_path() -> graphpack::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let seen_paths = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen_paths);
    let class = ClassType::builder("Hooked")
        .property("value", ValueKind::Int)
        .on_post_load(move |object| {
            assert_eq!(object.get("value"), Some(Value::Int(5)));
            counter.fetch_add(1, Ordering::SeqCst);
            recorder.lock().push(object.load_path());
        })
        .build();
    let root = Object::new(&class);
    root.set("value", Value::Int(5))?;
    let child = Object::new_child(&class, &root);
    child.set("value", Value::Int(5))?;

    let bytes = write(&[root, child], &SaveOptions::default())?;
    let options = LoadOptions::new().resource_path("levels/intro.gp");
    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &options)?;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(loaded.objects.iter().all(|o| o.is_post_loaded()));
    assert_eq!(loaded.objects[0].load_path().as_deref(), Some("levels/intro.gp"));
    assert_eq!(loaded.objects[1].load_path(), None);
    // Hooks already see the path of the main export.
    assert!(seen_paths.lock().contains(&Some("levels/intro.gp".to_owned())));
    Ok(())
}

#[test]
fn files_embedded_at_an_offset_load() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    root.set("value", Value::Int(11))?;

    let mut bytes = vec![0xAB; 100];
    GraphPack::write(&mut bytes, std::slice::from_ref(&root), &SaveOptions::default())?;
    assert!(bytes[..100].iter().all(|b| *b == 0xAB));

    let loaded = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::new().base_offset(100))?;
    assert_eq!(loaded.objects[0].get("value"), Some(Value::Int(11)));
    Ok(())
}

#[test]
#[cfg(not(target_arch = "wasm32"))]
fn file_round_trip() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    root.set("label", Value::Text("on disk".into()))?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("graph.gp");
    let saved = GraphPack::save(&path, std::slice::from_ref(&root), &SaveOptions::default())?;
    assert_eq!(saved.objects, 1);
    assert_eq!(std::fs::metadata(&path)?.len(), saved.bytes_written);

    let loaded = GraphPack::load(&path, &registry_of(&[&class]), &LoadOptions::default())?;
    assert_eq!(loaded.objects[0].get("label"), Some(Value::Text("on disk".into())));

    let report = GraphInspector::inspect(&path)?;
    assert!(report.to_string().contains("Node"));
    assert!(report.to_json()?.contains("\"exports\""));
    Ok(())
}

#[test]
fn xml_is_written_but_never_loaded() -> graphpack::Result<()> {
    let class = node_class();
    let root = Object::new(&class);
    root.set("label", Value::Text("<tag>".into()))?;

    let bytes = write(std::slice::from_ref(&root), &SaveOptions::new().format(SaveFormat::Xml))?;
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("<?xml"));
    assert!(text.contains("class=\"Node\""));

    let result = GraphPack::load_bytes(bytes, &registry_of(&[&class]), &LoadOptions::default());
    assert!(matches!(result, Err(GraphPackError::Format(_))));
    Ok(())
}

#[test]
fn cancelled_save_leaves_the_output_untouched() {
    let class = node_class();
    let root = Object::new(&class);
    let flag = CancellationFlag::new();
    flag.cancel();

    let mut bytes = vec![1, 2, 3];
    let result = GraphPack::write(
        &mut bytes,
        std::slice::from_ref(&root),
        &SaveOptions::new().cancel_with(flag),
    );
    assert!(matches!(result, Err(GraphPackError::Cancelled)));
    assert_eq!(bytes, vec![1, 2, 3]);
}

#[test]
fn empty_root_set_produces_an_empty_file() -> graphpack::Result<()> {
    let bytes = write(&[], &SaveOptions::default())?;
    let loaded = GraphPack::load_bytes(bytes, &TypeRegistry::new(), &LoadOptions::default())?;
    assert!(loaded.objects.is_empty());
    assert!(loaded.roots.is_empty());
    Ok(())
}
