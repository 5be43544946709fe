//! Integration tests for glTF mesh loading.

use std::path::PathBuf;

use glam::{Vec2, Vec3, Vec4};
use renderer_resources::{MeshData, ResourceError};

/// One triangle: three positions followed by three `u32` indices, embedded
/// as a data URI. No normals, colors or texture coordinates.
const TRIANGLE_GLTF: &str = r#"{
  "asset": { "version": "2.0" },
  "scene": 0,
  "scenes": [ { "nodes": [0] } ],
  "nodes": [ { "mesh": 0 } ],
  "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 }, "indices": 1 } ] } ],
  "buffers": [ {
    "byteLength": 48,
    "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAEAAAACAAAA"
  } ],
  "bufferViews": [
    { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
    { "buffer": 0, "byteOffset": 36, "byteLength": 12 }
  ],
  "accessors": [
    { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
      "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] },
    { "bufferView": 1, "componentType": 5125, "count": 3, "type": "SCALAR" }
  ]
}"#;

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, contents).expect("failed to write test asset");
    path
}

#[test]
fn test_load_triangle_with_defaults() {
    let path = write_temp("renderer_resources_triangle.gltf", TRIANGLE_GLTF);
    let mesh = MeshData::load_gltf(&path).expect("Failed to load glTF triangle");

    assert_eq!(mesh.indices, vec![0, 1, 2]);
    let positions: Vec<Vec3> = mesh.vertices.iter().map(|v| v.position).collect();
    assert_eq!(positions, vec![Vec3::ZERO, Vec3::X, Vec3::Y]);

    for vertex in &mesh.vertices {
        assert_eq!(vertex.normal, Vec3::Y);
        assert_eq!(vertex.color(), Vec4::ONE);
        assert_eq!(vertex.tex_coord, Vec2::ZERO);
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_document_without_meshes() {
    let path = write_temp(
        "renderer_resources_empty.gltf",
        r#"{ "asset": { "version": "2.0" } }"#,
    );
    assert!(matches!(
        MeshData::load_gltf(&path),
        Err(ResourceError::NoMeshes(_))
    ));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_malformed_document() {
    let path = write_temp("renderer_resources_broken.gltf", "{ not json");
    assert!(matches!(
        MeshData::load_gltf(&path),
        Err(ResourceError::GltfLoad { .. })
    ));
    let _ = std::fs::remove_file(&path);
}
