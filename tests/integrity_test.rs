#![allow(missing_docs)]

use std::sync::Arc;

use graphpack::{
    AsyncBuffer, ClassType, GraphInspector, GraphPack, GraphPackError, LoadOptions, Object, ObjectPtr, SaveFormat,
    SaveOptions, TypeRegistry, Value, ValueKind,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

fn counter_class() -> Arc<ClassType> {
    ClassType::builder("Counter").property("value", ValueKind::Int).build()
}

fn saved_counter(format: SaveFormat) -> graphpack::Result<(Vec<u8>, TypeRegistry)> {
    let class = counter_class();
    let object = Object::new(&class);
    object.set("value", Value::Int(42))?;

    let mut bytes = Vec::new();
    GraphPack::write(&mut bytes, &[object], &SaveOptions::new().format(format))?;
    let mut registry = TypeRegistry::new();
    registry.register(class);
    Ok((bytes, registry))
}

fn first_object_offset(bytes: &[u8]) -> graphpack::Result<usize> {
    let report = GraphInspector::inspect_bytes(bytes.to_vec())?;
    Ok(report.exports[0].offset as usize)
}

#[test]
fn protected_files_reject_corrupted_objects() -> graphpack::Result<()> {
    let (mut bytes, registry) = saved_counter(SaveFormat::Protected)?;
    let offset = first_object_offset(&bytes)?;
    bytes[offset + 2] ^= 0x01;

    let result = GraphPack::load_bytes(bytes, &registry, &LoadOptions::default());
    assert!(matches!(result, Err(GraphPackError::Integrity(_))), "{result:?}");
    Ok(())
}

#[test]
fn unprotected_files_load_corrupted_values() -> graphpack::Result<()> {
    let (mut bytes, registry) = saved_counter(SaveFormat::Unprotected)?;
    // compound (type, members), skip length, property, type, then the raw value
    let value_at = first_object_offset(&bytes)? + 20;
    bytes[value_at] ^= 0xFF;

    let loaded = GraphPack::load_bytes(bytes, &registry, &LoadOptions::default())?;
    assert_eq!(loaded.objects[0].get("value"), Some(Value::Int(42 ^ 0xFF)));
    Ok(())
}

#[test]
fn unprotected_files_are_smaller() -> graphpack::Result<()> {
    let (protected, _) = saved_counter(SaveFormat::Protected)?;
    let (unprotected, _) = saved_counter(SaveFormat::Unprotected)?;
    assert!(unprotected.len() < protected.len());
    Ok(())
}

#[test]
fn every_truncation_is_rejected() -> graphpack::Result<()> {
    let (bytes, registry) = saved_counter(SaveFormat::Protected)?;
    for len in 0..bytes.len() {
        let result = GraphPack::load_bytes(bytes[..len].to_vec(), &registry, &LoadOptions::default());
        assert!(result.is_err(), "truncated to {len} bytes but loaded");
    }
    Ok(())
}

#[test]
fn header_damage_is_a_format_error() -> graphpack::Result<()> {
    let (bytes, registry) = saved_counter(SaveFormat::Protected)?;
    for position in [0, 5, 9, 14, 40, 60] {
        let mut damaged = bytes.clone();
        damaged[position] ^= 0x40;
        let result = GraphPack::load_bytes(damaged, &registry, &LoadOptions::default());
        assert!(matches!(result, Err(GraphPackError::Format(_))), "byte {position}: {result:?}");
    }
    Ok(())
}

#[test]
fn table_damage_is_caught_by_chunk_crcs() -> graphpack::Result<()> {
    let (mut bytes, registry) = saved_counter(SaveFormat::Protected)?;
    let tables_start = graphpack::format::HEADER_SIZE;
    // first byte after the header belongs to the strings chunk
    bytes[tables_start + 1] ^= 0x20;

    let result = GraphPack::load_bytes(bytes, &registry, &LoadOptions::default());
    assert!(matches!(result, Err(GraphPackError::Format(_))), "{result:?}");
    Ok(())
}

#[test]
fn garbage_input_is_a_format_error() {
    let registry = TypeRegistry::new();
    for input in [Vec::new(), vec![0u8; 4], vec![0xFF; 4096], b"GRPK".to_vec()] {
        let result = GraphPack::load_bytes(input, &registry, &LoadOptions::default());
        assert!(matches!(result, Err(GraphPackError::Format(_))));
    }
}

#[test]
fn damaged_buffers_fail_on_access_only() -> graphpack::Result<()> {
    let class = ClassType::builder("Holder")
        .property("payload", ValueKind::Buffer)
        .property("value", ValueKind::Int)
        .build();
    let mut noise = vec![0u8; 16 * 1024];
    StdRng::seed_from_u64(7).fill_bytes(&mut noise);

    let holder: ObjectPtr = Object::new(&class);
    holder.set("payload", Value::Buffer(Some(AsyncBuffer::from_bytes(noise))))?;
    holder.set("value", Value::Int(3))?;

    let mut bytes = Vec::new();
    GraphPack::write(&mut bytes, std::slice::from_ref(&holder), &SaveOptions::default())?;
    let report = GraphInspector::inspect_bytes(bytes.clone())?;
    assert_eq!(report.buffers.len(), 1);
    assert_eq!(report.buffers[0].compression, "None");

    let middle = ((report.objects_end + report.buffers_end) / 2) as usize;
    bytes[middle] ^= 0x01;

    let mut registry = TypeRegistry::new();
    registry.register(class);
    let loaded = GraphPack::load_bytes(bytes, &registry, &LoadOptions::default())?;
    let object = &loaded.objects[0];
    assert_eq!(object.get("value"), Some(Value::Int(3)));

    let Some(Value::Buffer(Some(buffer))) = object.get("payload") else {
        return Err(GraphPackError::Internal("payload was not restored".into()));
    };
    assert!(!buffer.is_resident());
    assert!(matches!(buffer.load(), Err(GraphPackError::Integrity(_))));
    Ok(())
}

#[test]
fn deeply_nested_type_names_are_unknown_classes() -> graphpack::Result<()> {
    let depth = 200_000;
    let name = format!("{}int{}", "array<".repeat(depth), ">".repeat(depth));
    let class = ClassType::builder(name.as_str()).build();

    let mut bytes = Vec::new();
    GraphPack::write(&mut bytes, &[Object::new(&class)], &SaveOptions::default())?;

    let loaded = GraphPack::load_bytes(bytes, &TypeRegistry::new(), &LoadOptions::default())?;
    assert!(loaded.objects.is_empty());
    assert_eq!(loaded.skipped, 1);
    Ok(())
}
