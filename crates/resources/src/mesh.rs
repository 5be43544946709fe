//! Mesh data and glTF loading.
//!
//! All triangle primitives of every mesh in a file are merged into one vertex
//! list and one index list. Attributes a primitive does not provide get fixed
//! defaults: normal `(0, 1, 0)`, color white, texture coordinate `(0, 0)`.

use std::path::Path;

use glam::{Vec2, Vec3, Vec4};
use tracing::{debug, info, warn};

use renderer_rhi::vertex::{Index, Vertex};

use crate::error::{ResourceError, ResourceResult};

/// Normal used when a primitive has none.
pub const DEFAULT_NORMAL: Vec3 = Vec3::Y;
/// Vertex color used when a primitive has none.
pub const DEFAULT_COLOR: Vec4 = Vec4::ONE;
/// Texture coordinate used when a primitive has none.
pub const DEFAULT_TEX_COORD: Vec2 = Vec2::ZERO;

/// CPU-side indexed triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertices, one [`Vertex`] each.
    pub vertices: Vec<Vertex>,
    /// Triangle list indices.
    pub indices: Vec<Index>,
}

impl MeshData {
    /// Load every triangle primitive of a glTF (`.gltf` or `.glb`) file.
    ///
    /// # Arguments
    /// * `path` - Path to the glTF file
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::FileNotFound`] if `path` does not exist,
    /// [`ResourceError::GltfLoad`] if the file cannot be parsed and
    /// [`ResourceError::NoMeshes`] if it has no triangle geometry.
    pub fn load_gltf(path: &Path) -> ResourceResult<Self> {
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }

        let (document, buffers, _images) =
            gltf::import(path).map_err(|e| ResourceError::GltfLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let mut mesh = Self::default();
        for gltf_mesh in document.meshes() {
            for primitive in gltf_mesh.primitives() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    warn!(
                        "Skipping {:?} primitive in mesh '{}'",
                        primitive.mode(),
                        gltf_mesh.name().unwrap_or("<unnamed>")
                    );
                    continue;
                }

                let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
                let positions: Vec<Vec3> = reader
                    .read_positions()
                    .ok_or(ResourceError::NoPositionData)?
                    .map(Vec3::from)
                    .collect();
                let normals: Option<Vec<Vec3>> =
                    reader.read_normals().map(|it| it.map(Vec3::from).collect());
                let tex_coords: Option<Vec<Vec2>> = reader
                    .read_tex_coords(0)
                    .map(|it| it.into_f32().map(Vec2::from).collect());
                let colors: Option<Vec<Vec4>> = reader
                    .read_colors(0)
                    .map(|it| it.into_rgba_f32().map(Vec4::from).collect());
                let indices: Vec<Index> = match reader.read_indices() {
                    Some(indices) => indices.into_u32().collect(),
                    None => (0..positions.len() as Index).collect(),
                };

                mesh.append_primitive(
                    &positions,
                    normals.as_deref(),
                    tex_coords.as_deref(),
                    colors.as_deref(),
                    &indices,
                )?;
            }
        }

        if mesh.indices.is_empty() {
            return Err(ResourceError::NoMeshes(path.to_path_buf()));
        }

        info!(
            "Loaded mesh {}: {} vertices, {} triangles",
            path.display(),
            mesh.vertices.len(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }

    /// Load `path`, or fall back to [`MeshData::cube`] when the file is absent.
    ///
    /// # Errors
    ///
    /// Only a file that exists but fails to load is an error.
    pub fn load_or_cube(path: &Path) -> ResourceResult<Self> {
        match Self::load_gltf(path) {
            Err(ResourceError::FileNotFound(_)) => {
                warn!("{} not found, using procedural cube", path.display());
                Ok(Self::cube())
            }
            other => other,
        }
    }

    /// Append one primitive, filling absent attributes with defaults and
    /// rebasing its indices past the existing vertices.
    fn append_primitive(
        &mut self,
        positions: &[Vec3],
        normals: Option<&[Vec3]>,
        tex_coords: Option<&[Vec2]>,
        colors: Option<&[Vec4]>,
        indices: &[Index],
    ) -> ResourceResult<()> {
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            return Err(ResourceError::IndexOutOfRange {
                index,
                vertex_count: positions.len(),
            });
        }

        let base = self.vertices.len() as Index;
        self.vertices
            .extend(positions.iter().enumerate().map(|(i, &position)| {
                Vertex::new(
                    position,
                    colors.and_then(|c| c.get(i).copied()).unwrap_or(DEFAULT_COLOR),
                    tex_coords
                        .and_then(|t| t.get(i).copied())
                        .unwrap_or(DEFAULT_TEX_COORD),
                    normals
                        .and_then(|n| n.get(i).copied())
                        .unwrap_or(DEFAULT_NORMAL),
                )
            }));

        // Drop a trailing partial triangle.
        let whole = indices.len() - indices.len() % 3;
        if whole != indices.len() {
            debug!("Ignoring {} trailing indices", indices.len() - whole);
        }
        self.indices
            .extend(indices[..whole].iter().map(|&i| base + i));
        Ok(())
    }

    /// A unit cube centered on the origin with per-face normals and UVs.
    pub fn cube() -> Self {
        // (normal, tangent u, tangent v) per face
        const FACES: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        ];
        const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let mut mesh = Self::default();
        for (normal, u, v) in FACES {
            let base = mesh.vertices.len() as Index;
            for (su, sv) in CORNERS {
                let position = 0.5 * (normal + su * u + sv * v);
                let tex_coord = Vec2::new((su + 1.0) * 0.5, (1.0 - sv) * 0.5);
                mesh.vertices
                    .push(Vertex::new(position, DEFAULT_COLOR, tex_coord, normal));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Number of triangles.
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_attributes() {
        let mut mesh = MeshData::default();
        mesh.append_primitive(&[Vec3::ZERO, Vec3::X, Vec3::Y], None, None, None, &[0, 1, 2])
            .unwrap();
        for vertex in &mesh.vertices {
            assert_eq!(vertex.normal, DEFAULT_NORMAL);
            assert_eq!(vertex.color(), DEFAULT_COLOR);
            assert_eq!(vertex.tex_coord, DEFAULT_TEX_COORD);
        }
    }

    #[test]
    fn test_primitives_are_rebased() {
        let mut mesh = MeshData::default();
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        mesh.append_primitive(&tri, None, None, None, &[0, 1, 2]).unwrap();
        mesh.append_primitive(&tri, None, None, None, &[2, 1, 0]).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2, 5, 4, 3]);
        assert_eq!(mesh.triangle_count(), 2);
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let mut mesh = MeshData::default();
        let result = mesh.append_primitive(&[Vec3::ZERO], None, None, None, &[0, 0, 3]);
        assert!(matches!(
            result,
            Err(ResourceError::IndexOutOfRange { index: 3, vertex_count: 1 })
        ));
    }

    #[test]
    fn test_cube_is_closed_and_outward() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|k| cube.vertices[tri[k] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            // Counter-clockwise winding seen from outside.
            assert!(face_normal.dot(a.normal) > 0.0);
            assert!(a.position.abs().max_element() <= 0.5);
        }
    }

    #[test]
    fn test_missing_file_falls_back_to_cube() {
        let mesh = MeshData::load_or_cube(Path::new("no/such/mesh.gltf")).unwrap();
        assert_eq!(mesh, MeshData::cube());
    }
}
