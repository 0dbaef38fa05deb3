//! Unit tests for the voxel block grid and its passes.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use glam::{IVec3, Vec3};

    use crate::camera::{Extrinsic, PinholeIntrinsics};
    use crate::image::{ColorImage, DepthImage};
    use crate::voxel_block_grid::block_index::{BlockIndex, ShardedBlockIndex};
    use crate::voxel_block_grid::{
        AttrDtype, AttributeSpec, BlockCoord, GridOptions, VoxelBlockGrid,
    };
    use crate::FusionError;

    /// Intrinsics centered on a `rows x cols` image with a moderate FOV.
    fn test_intrinsics(rows: usize, cols: usize, focal: f32) -> PinholeIntrinsics {
        PinholeIntrinsics::new(focal, focal, cols as f32 * 0.5, rows as f32 * 0.5)
    }

    /// Constant-depth frame of a flat wall facing the camera.
    fn wall_depth(rows: usize, cols: usize, depth_m: f32, scale: f32) -> DepthImage {
        DepthImage::new(rows, cols, vec![depth_m * scale; rows * cols])
            .expect("wall frame shape is valid")
    }

    /// Depth frame of a sphere, rendered analytically.
    ///
    /// Assumes the camera sits at `eye` on the sphere center's -Z axis with
    /// axis-aligned orientation, so camera rays are world rays.
    fn sphere_depth(
        rows: usize,
        cols: usize,
        intrinsics: &PinholeIntrinsics,
        eye: Vec3,
        center: Vec3,
        radius: f32,
        scale: f32,
    ) -> DepthImage {
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                let dir = intrinsics.pixel_ray(c as f32, r as f32);
                let o = eye - center;
                let a = dir.dot(dir);
                let b = 2.0 * o.dot(dir);
                let k = o.dot(o) - radius * radius;
                let disc = b * b - 4.0 * a * k;
                if disc >= 0.0 {
                    let t = (-b - disc.sqrt()) / (2.0 * a);
                    if t > 0.0 {
                        // dir has unit z, so t is the z-depth directly.
                        data[r * cols + c] = t * scale;
                    }
                }
            }
        }
        DepthImage::new(rows, cols, data).expect("sphere frame shape is valid")
    }

    fn wall_grid_options() -> GridOptions {
        GridOptions {
            voxel_size: 0.01,
            block_resolution: 16,
            block_capacity: 1000,
            weight_cap: 128.0,
        }
    }

    // =========================================================================
    // Coordinate arithmetic
    // =========================================================================

    #[test]
    fn test_block_coord_of_world_point() {
        let bs = 0.16;
        assert_eq!(
            BlockCoord::of_world_point(Vec3::new(0.0, 0.01, 0.159), bs),
            BlockCoord::new(0, 0, 0)
        );
        assert_eq!(
            BlockCoord::of_world_point(Vec3::new(-0.01, 0.17, 0.32), bs),
            BlockCoord::new(-1, 1, 2)
        );
    }

    #[test]
    fn test_block_coord_of_voxel() {
        let (block, local) = BlockCoord::of_voxel(IVec3::new(-1, 16, 5), 16);
        assert_eq!(block, BlockCoord::new(-1, 1, 0));
        assert_eq!(local, IVec3::new(15, 0, 5));

        let (block, local) = BlockCoord::of_voxel(IVec3::new(-17, 0, 31), 16);
        assert_eq!(block, BlockCoord::new(-2, 0, 1));
        assert_eq!(local, IVec3::new(15, 0, 15));
    }

    // =========================================================================
    // Block index adapter
    // =========================================================================

    #[test]
    fn test_activate_then_find() {
        let index = ShardedBlockIndex::new(8);
        let keys = vec![
            BlockCoord::new(0, 0, 0),
            BlockCoord::new(1, -2, 3),
            BlockCoord::new(-4, 5, -6),
        ];

        let (slots, mask) = index.activate(&keys);
        assert!(mask.iter().all(|&ok| ok), "all keys fit under capacity");

        let (found_slots, found_mask) = index.find(&keys);
        assert!(found_mask.iter().all(|&ok| ok), "activated keys must resolve");
        assert_eq!(slots, found_slots, "find must return the activation slots");

        let (_, missing) = index.find(&[BlockCoord::new(9, 9, 9)]);
        assert_eq!(missing, vec![false]);
    }

    #[test]
    fn test_activate_duplicates_resolve_to_same_slot() {
        let index = ShardedBlockIndex::new(8);
        let a = BlockCoord::new(2, 2, 2);
        let (slots, mask) = index.activate(&[a, a, BlockCoord::new(0, 0, 1), a]);
        assert_eq!(mask, vec![true, true, true, true]);
        assert_eq!(slots[0], slots[1]);
        assert_eq!(slots[0], slots[3]);
        assert_ne!(slots[0], slots[2]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_activate_beyond_capacity() {
        let index = ShardedBlockIndex::new(2);
        let keys: Vec<BlockCoord> = (0..4).map(|i| BlockCoord::new(i, 0, 0)).collect();
        let (_, mask) = index.activate(&keys);
        assert_eq!(mask.iter().filter(|&&ok| ok).count(), 2);
        assert_eq!(index.len(), 2);

        // Present keys still resolve once the index is full.
        let (_, mask) = index.activate(&[keys[0]]);
        assert_eq!(mask, vec![true]);

        // New keys keep failing, and the failure is per key, not an error.
        let (_, mask) = index.activate(&[BlockCoord::new(9, 9, 9)]);
        assert_eq!(mask, vec![false]);
    }

    // =========================================================================
    // Touch pass
    // =========================================================================

    #[test]
    fn test_touch_wall_covers_truncation_band() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);

        let coords = grid
            .touched_block_coordinates(&depth, &intr, &Extrinsic::identity(), 1000.0, 3.0)
            .expect("touch succeeds on a valid frame");

        assert!(!coords.is_empty(), "the wall frustum must touch blocks");
        // The inflated segment spans z in [0.92, 1.08]; with 0.16 blocks that
        // is block layers 5 and 6 only.
        for coord in &coords {
            assert!(
                coord.z == 5 || coord.z == 6,
                "touched block {coord:?} lies outside the truncation band"
            );
        }
        assert_eq!(
            grid.num_active_blocks(),
            0,
            "touch must not allocate permanent blocks"
        );
    }

    #[test]
    fn test_touch_scratch_cleared_between_frames() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let intr = test_intrinsics(48, 64, 60.0);
        let extr = Extrinsic::identity();

        let near = wall_depth(48, 64, 1.0, 1000.0);
        let far = wall_depth(48, 64, 2.0, 1000.0);

        let set_near: BTreeSet<BlockCoord> = grid
            .touched_block_coordinates(&near, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds")
            .into_iter()
            .collect();
        let set_far: BTreeSet<BlockCoord> = grid
            .touched_block_coordinates(&far, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds")
            .into_iter()
            .collect();

        assert!(
            set_near.is_disjoint(&set_far),
            "blocks from the previous frame leaked through the scratch set"
        );

        // A fresh grid must agree: the scratch reuse is invisible.
        let mut fresh = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let set_fresh: BTreeSet<BlockCoord> = fresh
            .touched_block_coordinates(&far, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds")
            .into_iter()
            .collect();
        assert_eq!(set_far, set_fresh);
    }

    #[test]
    fn test_point_touch_order_independent() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let points = vec![
            Vec3::new(0.1, 0.1, 0.1),
            Vec3::new(1.0, -0.5, 0.3),
            Vec3::new(-0.2, 0.0, 0.9),
            Vec3::new(0.1, 0.1, 0.1),
            Vec3::new(0.55, 0.55, 0.55),
        ];
        let forward: BTreeSet<BlockCoord> = grid
            .touched_block_coordinates_from_points(&points)
            .into_iter()
            .collect();

        let reversed_points: Vec<Vec3> = points.into_iter().rev().collect();
        let reversed: BTreeSet<BlockCoord> = grid
            .touched_block_coordinates_from_points(&reversed_points)
            .into_iter()
            .collect();

        assert_eq!(forward, reversed, "touch must be order-independent as a set");
        assert!(!forward.is_empty());
    }

    #[test]
    fn test_point_touch_empty_cloud_warns_empty() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        assert!(grid.touched_block_coordinates_from_points(&[]).is_empty());
    }

    // =========================================================================
    // Integration pass
    // =========================================================================

    /// Integrate one flat wall frame and return the grid plus its touched
    /// coordinates.
    fn integrated_wall_grid() -> (VoxelBlockGrid, Vec<BlockCoord>) {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);
        let extr = Extrinsic::identity();
        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        grid.integrate(&coords, &depth, None, &intr, &extr, 1000.0, 3.0)
            .expect("integration succeeds");
        (grid, coords)
    }

    #[test]
    fn test_integrate_wall_scenario() {
        let (grid, _) = integrated_wall_grid();
        let trunc = grid.truncation_distance();
        assert!(grid.num_active_blocks() >= 1, "the wall must allocate blocks");

        let tsdf = grid
            .attribute("tsdf")
            .and_then(|a| a.as_f32())
            .expect("tsdf buffer exists")
            .to_vec();
        let weight = grid
            .attribute("weight")
            .and_then(|a| a.as_f32())
            .expect("weight buffer exists")
            .to_vec();

        let mut observed = 0usize;
        for v in grid.active_voxel_coordinates() {
            let i = grid.locate_voxel(v).expect("active voxel resolves");
            let w = weight[i];
            assert!(w >= 0.0);
            if w == 0.0 {
                assert_eq!(
                    tsdf[i], 0.0,
                    "an unobserved voxel must keep the default TSDF"
                );
            } else {
                observed += 1;
                assert_eq!(w, 1.0, "a single frame gives every observed voxel weight 1");
                assert!(
                    tsdf[i].abs() <= trunc + 1e-5,
                    "TSDF {} exceeds the truncation band {trunc}",
                    tsdf[i]
                );
            }
        }
        assert!(observed > 0, "some voxels must be observed");
    }

    #[test]
    fn test_double_integration_matches_single() {
        let (once, _) = integrated_wall_grid();

        let mut twice = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);
        let extr = Extrinsic::identity();
        let coords = twice
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        for _ in 0..2 {
            twice
                .integrate(&coords, &depth, None, &intr, &extr, 1000.0, 3.0)
                .expect("integration succeeds");
        }

        let tsdf_once = once.attribute("tsdf").and_then(|a| a.as_f32()).unwrap().to_vec();
        let tsdf_twice = twice.attribute("tsdf").and_then(|a| a.as_f32()).unwrap().to_vec();
        let weight_once = once.attribute("weight").and_then(|a| a.as_f32()).unwrap().to_vec();
        let weight_twice = twice.attribute("weight").and_then(|a| a.as_f32()).unwrap().to_vec();

        for v in once.active_voxel_coordinates() {
            let i1 = once.locate_voxel(v).expect("voxel active in single grid");
            let i2 = twice.locate_voxel(v).expect("voxel active in double grid");
            assert!(
                (tsdf_once[i1] - tsdf_twice[i2]).abs() < 1e-5,
                "re-integrating the same frame must not move the TSDF"
            );
            if weight_once[i1] > 0.0 {
                assert_eq!(weight_twice[i2], 2.0 * weight_once[i1]);
            }
        }
    }

    #[test]
    fn test_weight_cap_saturates() {
        let mut options = wall_grid_options();
        options.weight_cap = 1.0;
        let mut grid = VoxelBlockGrid::with_default_schema(options).expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);
        let extr = Extrinsic::identity();
        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        for _ in 0..3 {
            grid.integrate(&coords, &depth, None, &intr, &extr, 1000.0, 3.0)
                .expect("integration succeeds");
        }

        let weight = grid.attribute("weight").and_then(|a| a.as_f32()).unwrap();
        assert!(
            weight.iter().all(|&w| w <= 1.0),
            "weights must saturate at the configured cap"
        );
        assert!(weight.iter().any(|&w| w == 1.0));
    }

    #[test]
    fn test_integrate_capacity_exhaustion_is_not_fatal() {
        let mut options = wall_grid_options();
        options.block_capacity = 2;
        let mut grid = VoxelBlockGrid::with_default_schema(options).expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);
        let extr = Extrinsic::identity();
        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        assert!(coords.len() > 2, "the wall touches more blocks than fit");

        grid.integrate(&coords, &depth, None, &intr, &extr, 1000.0, 3.0)
            .expect("capacity overflow must not fail the call");
        assert_eq!(grid.num_active_blocks(), 2);
    }

    #[test]
    fn test_color_integration() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let rows = 24;
        let cols = 32;
        let rgb = [0.5, 0.25, 1.0];
        let depth = wall_depth(rows, cols, 0.5, 1000.0);
        let color = ColorImage::new(rows, cols, vec![rgb; rows * cols]).expect("shape is valid");
        let intr = test_intrinsics(rows, cols, 30.0);
        let extr = Extrinsic::identity();

        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        grid.integrate(&coords, &depth, Some(&color), &intr, &extr, 1000.0, 3.0)
            .expect("integration succeeds");

        // A voxel straddling the wall plane right on the optical axis.
        let i = grid
            .locate_voxel(IVec3::new(0, 0, 50))
            .expect("the wall voxel is allocated");
        let weight = grid.attribute("weight").and_then(|a| a.as_f32()).unwrap();
        assert!(weight[i] > 0.0, "the wall voxel must be observed");
        let stored = grid.attribute("color").and_then(|a| a.as_f32()).unwrap();
        for ch in 0..3 {
            assert!(
                (stored[i * 3 + ch] - rgb[ch]).abs() < 1e-5,
                "a single frame stores its color verbatim"
            );
        }
    }

    // =========================================================================
    // Schema and error handling
    // =========================================================================

    #[test]
    fn test_construction_validation() {
        let mut options = wall_grid_options();
        options.voxel_size = 0.0;
        assert!(matches!(
            VoxelBlockGrid::with_default_schema(options),
            Err(FusionError::InvalidVoxelSize(_))
        ));

        let dup = vec![
            AttributeSpec::new("tsdf", AttrDtype::F32, 1),
            AttributeSpec::new("tsdf", AttrDtype::F32, 1),
        ];
        assert!(matches!(
            VoxelBlockGrid::new(dup, wall_grid_options()),
            Err(FusionError::DuplicateAttribute(_))
        ));

        assert!(matches!(
            VoxelBlockGrid::new(Vec::new(), wall_grid_options()),
            Err(FusionError::EmptySchema)
        ));
    }

    #[test]
    fn test_fusion_schema_is_checked_before_kernels() {
        // No weight attribute: integration must fail fast.
        let schema = vec![AttributeSpec::new("tsdf", AttrDtype::F32, 1)];
        let mut grid = VoxelBlockGrid::new(schema, wall_grid_options()).expect("schema stores");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let intr = test_intrinsics(48, 64, 60.0);
        let err = grid
            .integrate(
                &[BlockCoord::new(0, 0, 5)],
                &depth,
                None,
                &intr,
                &Extrinsic::identity(),
                1000.0,
                3.0,
            )
            .expect_err("missing weight attribute must fail");
        assert!(matches!(err, FusionError::MissingKernelAttribute("weight")));
        assert_eq!(
            grid.num_active_blocks(),
            0,
            "a failed call must not commit partial work"
        );

        // Wrong dtype for tsdf.
        let schema = vec![
            AttributeSpec::new("tsdf", AttrDtype::U16, 1),
            AttributeSpec::new("weight", AttrDtype::F32, 1),
        ];
        let grid = VoxelBlockGrid::new(schema, wall_grid_options()).expect("schema stores");
        assert!(matches!(
            grid.extract_surface_points(10, 1.0),
            Err(FusionError::KernelAttrDtype { .. })
        ));
    }

    #[test]
    fn test_missing_attribute_lookup_is_recoverable() {
        let (grid, _) = integrated_wall_grid();
        assert!(grid.attribute("colour").is_none());
        let res3 = grid.block_resolution().pow(3);
        assert_eq!(
            grid.attribute("tsdf").map(|a| a.len()),
            Some(grid.block_capacity() * res3)
        );
    }

    #[test]
    fn test_color_mismatch_rejected_before_any_write() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let depth = wall_depth(48, 64, 1.0, 1000.0);
        let color = ColorImage::new(24, 32, vec![[0.0; 3]; 24 * 32]).expect("shape is valid");
        let intr = test_intrinsics(48, 64, 60.0);
        let err = grid
            .integrate(
                &[BlockCoord::new(0, 0, 5)],
                &depth,
                Some(&color),
                &intr,
                &Extrinsic::identity(),
                1000.0,
                3.0,
            )
            .expect_err("mismatched color frame must fail");
        assert!(matches!(err, FusionError::ColorDepthMismatch { .. }));
        assert_eq!(grid.num_active_blocks(), 0);
    }

    // =========================================================================
    // Ray casting pass
    // =========================================================================

    #[test]
    fn test_raycast_wall_reproduces_depth() {
        let (grid, coords) = integrated_wall_grid();
        let intr = test_intrinsics(48, 64, 60.0);
        let maps = grid
            .ray_cast(&coords, &intr, &Extrinsic::identity(), 64, 48, 1000.0, 0.1, 3.0, 1.0)
            .expect("ray cast succeeds");

        let voxel = grid.voxel_size();
        let mut hits = 0usize;
        for (i, &d) in maps.depth.iter().enumerate() {
            if d > 0.0 {
                hits += 1;
                assert!(
                    (d / 1000.0 - 1.0).abs() <= voxel + 1e-3,
                    "pixel {i} rendered depth {} m, expected 1.0 m within a voxel",
                    d / 1000.0
                );
            } else {
                assert!(
                    maps.mask[i].iter().all(|&m| !m),
                    "a missed pixel must have an all-false mask"
                );
            }
        }
        assert!(
            hits > 64 * 48 / 2,
            "most wall pixels should find a crossing, got {hits}"
        );

        // The center pixel looks straight at the wall.
        let center = 24 * 64 + 32;
        assert!(maps.depth[center] > 0.0, "the center ray must hit the wall");
        assert!(
            maps.mask[center].iter().any(|&m| m),
            "the center crossing must resolve interpolation voxels"
        );
        // Its normal faces the camera (-z).
        assert!(
            maps.normal[center][2] < -0.9,
            "wall normal should face the camera, got {:?}",
            maps.normal[center]
        );
    }

    #[test]
    fn test_raycast_index_map_replays_interpolation() {
        let (grid, coords) = integrated_wall_grid();
        let intr = test_intrinsics(48, 64, 60.0);
        let maps = grid
            .ray_cast(&coords, &intr, &Extrinsic::identity(), 64, 48, 1000.0, 0.1, 3.0, 1.0)
            .expect("ray cast succeeds");

        let tsdf = grid.attribute("tsdf").and_then(|a| a.as_f32()).unwrap();
        let center = 24 * 64 + 32;
        let mut acc = 0.0f32;
        let mut ratio_sum = 0.0f32;
        for k in 0..8 {
            if maps.mask[center][k] {
                acc += maps.ratio[center][k] * tsdf[maps.index[center][k] as usize];
                ratio_sum += maps.ratio[center][k];
            }
        }
        assert!(ratio_sum > 0.0, "the center pixel resolves some corners");
        assert!(
            (acc / ratio_sum).abs() <= grid.voxel_size(),
            "replayed TSDF interpolation at the surface should be near zero"
        );
    }

    #[test]
    fn test_raycast_empty_grid_misses_everywhere() {
        let grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let intr = test_intrinsics(48, 64, 60.0);
        let maps = grid
            .ray_cast(&[], &intr, &Extrinsic::identity(), 64, 48, 1000.0, 0.1, 3.0, 1.0)
            .expect("ray cast succeeds on an empty grid");
        assert!(maps.depth.iter().all(|&d| d == 0.0));
        assert!(maps.mask.iter().all(|m| m.iter().all(|&b| !b)));
    }

    // =========================================================================
    // Surface extraction pass
    // =========================================================================

    #[test]
    fn test_extract_sphere_points_lie_on_sphere() {
        let options = GridOptions {
            voxel_size: 0.01,
            block_resolution: 16,
            block_capacity: 4000,
            weight_cap: 128.0,
        };
        let mut grid = VoxelBlockGrid::with_default_schema(options).expect("options are valid");

        // Narrow FOV: the frame observes the sphere's central cap head-on,
        // away from grazing rays at the silhouette.
        let (rows, cols) = (120, 160);
        let intr = test_intrinsics(rows, cols, 380.0);
        let eye = Vec3::new(0.0, 0.0, -1.5);
        let radius = 0.5;
        let extr = Extrinsic::look_at(eye, Vec3::ZERO, Vec3::Y);
        let depth = sphere_depth(rows, cols, &intr, eye, Vec3::ZERO, radius, 1000.0);

        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        grid.integrate(&coords, &depth, None, &intr, &extr, 1000.0, 3.0)
            .expect("integration succeeds");

        let estimate = 400_000;
        let cloud = grid
            .extract_surface_points(estimate, 1.0)
            .expect("extraction succeeds");
        assert!(!cloud.is_empty(), "the sphere surface must produce points");
        assert!(cloud.len() <= estimate);

        let voxel = grid.voxel_size();
        for p in &cloud.positions {
            let dist = Vec3::from_array(*p).length();
            assert!(
                (dist - radius).abs() <= voxel + 1e-3,
                "surface point {p:?} is {dist} from the center, expected {radius} within a voxel"
            );
        }
    }

    #[test]
    fn test_extract_budget_is_a_hard_ceiling() {
        let (grid, _) = integrated_wall_grid();
        let cloud = grid
            .extract_surface_points(10, 1.0)
            .expect("extraction succeeds");
        assert!(cloud.len() <= 10, "the point budget must never be exceeded");
        assert!(!cloud.is_empty(), "the wall has crossings to emit");
    }

    #[test]
    fn test_extract_empty_grid_returns_empty_cloud() {
        let grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let cloud = grid
            .extract_surface_points(1000, 1.0)
            .expect("extraction on an empty grid is not an error");
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_extract_wall_points_carry_color() {
        let mut grid = VoxelBlockGrid::with_default_schema(wall_grid_options())
            .expect("options are valid");
        let rows = 24;
        let cols = 32;
        let rgb = [0.9, 0.4, 0.1];
        let depth = wall_depth(rows, cols, 0.5, 1000.0);
        let color = ColorImage::new(rows, cols, vec![rgb; rows * cols]).expect("shape is valid");
        let intr = test_intrinsics(rows, cols, 30.0);
        let extr = Extrinsic::identity();
        let coords = grid
            .touched_block_coordinates(&depth, &intr, &extr, 1000.0, 3.0)
            .expect("touch succeeds");
        grid.integrate(&coords, &depth, Some(&color), &intr, &extr, 1000.0, 3.0)
            .expect("integration succeeds");

        let cloud = grid
            .extract_surface_points(100_000, 1.0)
            .expect("extraction succeeds");
        assert!(!cloud.is_empty());
        assert_eq!(cloud.colors.len(), cloud.len());
        for c in &cloud.colors {
            for ch in 0..3 {
                assert!(
                    (c[ch] - rgb[ch]).abs() < 1e-4,
                    "a uniformly colored wall must extract uniform colors, got {c:?}"
                );
            }
        }
    }

    // =========================================================================
    // Point cloud dump
    // =========================================================================

    #[test]
    fn test_point_cloud_cbor_round_trip() {
        let (grid, _) = integrated_wall_grid();
        let cloud = grid
            .extract_surface_points(500, 1.0)
            .expect("extraction succeeds");
        assert!(!cloud.is_empty());

        let path = std::env::temp_dir().join("depthfusion_test_round_trip.cbor");
        cloud.save(&path).expect("save succeeds");
        let loaded = crate::point_cloud::PointCloud::load(&path).expect("load succeeds");
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), cloud.len());
        assert_eq!(loaded.positions, cloud.positions);
        assert_eq!(loaded.normals, cloud.normals);
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn test_stats_track_passes() {
        let (grid, coords) = integrated_wall_grid();
        let snapshot = grid.stats();
        assert_eq!(snapshot.blocks_allocated as usize, grid.num_active_blocks());
        assert!(snapshot.voxels_integrated > 0);

        let intr = test_intrinsics(48, 64, 60.0);
        grid.ray_cast(&coords, &intr, &Extrinsic::identity(), 64, 48, 1000.0, 0.1, 3.0, 1.0)
            .expect("ray cast succeeds");
        assert!(grid.stats().rays_marched > 0);
    }
}
