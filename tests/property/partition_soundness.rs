//! Properties of job partitioning: completeness, capacity, tile coverage.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use verdis::{
    create_sub_verifications, ConditionTest, DatasetId, Envelope, ExecType, IdSequence,
    ParallelConfiguration, QualityCondition, QualityConditionGroup, QualitySpecification,
    VerificationRequest,
};

/// Shape of one generated partitioning problem.
#[derive(Clone, Debug)]
struct Problem {
    non_container: usize,
    container_groups: Vec<usize>,
    tile_parallel: usize,
    parallelism: usize,
    max_non_container_tasks: usize,
    max_full_area_tasks: usize,
    max_split_area_tasks: usize,
    extent_w: f64,
    extent_h: f64,
    tile_size: f64,
}

fn arb_problem() -> impl Strategy<Value = Problem> {
    (
        0usize..6,
        prop::collection::vec(1usize..5, 0..3),
        0usize..3,
        2usize..8,
        0usize..4,
        0usize..4,
        0usize..6,
        10.0f64..300.0,
        10.0f64..300.0,
        5.0f64..80.0,
    )
        .prop_map(
            |(
                non_container,
                container_groups,
                tile_parallel,
                parallelism,
                max_non_container_tasks,
                max_full_area_tasks,
                max_split_area_tasks,
                extent_w,
                extent_h,
                tile_size,
            )| Problem {
                non_container,
                container_groups,
                tile_parallel,
                parallelism,
                max_non_container_tasks,
                max_full_area_tasks,
                max_split_area_tasks,
                extent_w,
                extent_h,
                tile_size,
            },
        )
}

/// Build groups with globally unique condition ids from the problem shape.
fn build(problem: &Problem) -> (VerificationRequest, Vec<QualityConditionGroup>, ParallelConfiguration)
{
    let mut next_id = 0u32;
    let mut make_group = |exec_type: ExecType, count: usize| {
        let mut group = QualityConditionGroup::new(exec_type);
        for _ in 0..count {
            let id = next_id;
            next_id += 1;
            group.push(
                QualityCondition::new(id, format!("qc{}", id)),
                vec![ConditionTest {
                    name: format!("t{}", id),
                    dataset: DatasetId(0),
                }],
            );
        }
        group
    };

    let mut groups = Vec::new();
    if problem.non_container > 0 {
        groups.push(make_group(ExecType::NonContainer, problem.non_container));
    }
    for &count in &problem.container_groups {
        groups.push(make_group(ExecType::Container, count));
    }
    if problem.tile_parallel > 0 {
        groups.push(make_group(ExecType::TileParallel, problem.tile_parallel));
    }

    let conditions = groups
        .iter()
        .flat_map(|g| g.entries().map(|(c, _)| c.clone()))
        .collect();
    let mut request = VerificationRequest::new(
        Arc::new(QualitySpecification::new("prop", conditions)),
        problem.tile_size,
    );
    request.max_parallelism = problem.parallelism;
    request.perimeter = Some(Envelope::new(0.0, 0.0, problem.extent_w, problem.extent_h));

    let config = ParallelConfiguration {
        max_non_container_tasks: problem.max_non_container_tasks,
        max_full_area_tasks: problem.max_full_area_tasks,
        max_split_area_tasks: problem.max_split_area_tasks,
        ..Default::default()
    };

    (request, groups, config)
}

proptest! {
    /// Every condition lands in the produced units exactly once per intended
    /// (condition, tile) pair: untiled conditions once overall, tiled
    /// conditions once per tile.
    #[test]
    fn partition_is_complete_and_duplicate_free(problem in arb_problem()) {
        let (request, groups, config) = build(&problem);
        let partition =
            create_sub_verifications(&request, &groups, &config, &mut IdSequence::new());

        let tile_count = partition
            .units
            .iter()
            .filter(|u| u.tile_envelope().is_some())
            .count();

        // Count appearances per condition across units.
        let mut untiled_appearances: HashMap<u32, usize> = HashMap::new();
        let mut tiled_appearances: HashMap<u32, usize> = HashMap::new();
        for unit in &partition.units {
            for id in unit.group().condition_ids() {
                let bucket = if unit.tile_envelope().is_some() {
                    &mut tiled_appearances
                } else {
                    &mut untiled_appearances
                };
                *bucket.entry(id.0).or_insert(0) += 1;
            }
        }

        for group in &groups {
            let tiled = group.exec_type() == ExecType::TileParallel;
            for id in group.condition_ids() {
                if tiled {
                    prop_assert_eq!(
                        tiled_appearances.get(&id.0).copied().unwrap_or(0),
                        tile_count,
                        "tiled condition {} must appear once per tile",
                        id.0
                    );
                    prop_assert!(!untiled_appearances.contains_key(&id.0));
                } else {
                    prop_assert_eq!(
                        untiled_appearances.get(&id.0).copied().unwrap_or(0),
                        1,
                        "untiled condition {} must appear exactly once",
                        id.0
                    );
                    prop_assert!(!tiled_appearances.contains_key(&id.0));
                }
            }
        }

        // Ids are unique and sequential in dispatch order.
        for (i, unit) in partition.units.iter().enumerate() {
            prop_assert_eq!(unit.id().0 as usize, i);
        }
    }

    /// Produced bucket counts never exceed the configured caps.
    #[test]
    fn partition_respects_caps(problem in arb_problem()) {
        let (request, groups, config) = build(&problem);
        let partition =
            create_sub_verifications(&request, &groups, &config, &mut IdSequence::new());

        let count_of = |exec_type: ExecType| {
            partition
                .units
                .iter()
                .filter(|u| u.exec_type() == exec_type)
                .count()
        };

        if config.max_non_container_tasks > 0 {
            prop_assert!(count_of(ExecType::NonContainer) <= config.max_non_container_tasks);
        }
        if config.max_full_area_tasks > 0 {
            prop_assert!(count_of(ExecType::Mixed) <= config.max_full_area_tasks);
        }
        if config.max_split_area_tasks > 0 && problem.tile_parallel > 0 {
            // A natural grid below the cap is kept as-is; above the cap the
            // balanced grid is bounded by the cap.
            let natural_nx = (problem.extent_w / problem.tile_size).ceil().max(1.0) as usize;
            let natural_ny = (problem.extent_h / problem.tile_size).ceil().max(1.0) as usize;
            let natural = natural_nx * natural_ny;
            if config.max_split_area_tasks < natural {
                prop_assert!(count_of(ExecType::TileParallel) <= config.max_split_area_tasks);
            } else {
                prop_assert_eq!(count_of(ExecType::TileParallel), natural);
            }
        }
    }

    /// Tiles of a tile-parallel job are interior-disjoint and cover the
    /// perimeter.
    #[test]
    fn tiles_cover_without_overlap(
        w in 10.0f64..400.0,
        h in 10.0f64..400.0,
        size in 5.0f64..100.0,
    ) {
        let group = {
            let mut g = QualityConditionGroup::new(ExecType::TileParallel);
            g.push(
                QualityCondition::new(0, "qc0"),
                vec![ConditionTest { name: "t".into(), dataset: DatasetId(0) }],
            );
            g
        };
        let conditions = group.entries().map(|(c, _)| c.clone()).collect();
        let mut request = VerificationRequest::new(
            Arc::new(QualitySpecification::new("prop", conditions)),
            size,
        );
        request.max_parallelism = 2;
        request.perimeter = Some(Envelope::new(0.0, 0.0, w, h));

        let partition = create_sub_verifications(
            &request,
            std::slice::from_ref(&group),
            &ParallelConfiguration::default(),
            &mut IdSequence::new(),
        );

        let tiles: Vec<Envelope> = partition
            .units
            .iter()
            .filter_map(|u| u.tile_envelope().copied())
            .collect();
        prop_assert!(!tiles.is_empty());

        // Pairwise interior-disjoint: shared edges are fine, area overlap is
        // not.
        for (i, a) in tiles.iter().enumerate() {
            for b in &tiles[i + 1..] {
                if let Some(overlap) = a.intersection(b) {
                    prop_assert!(
                        overlap.width() * overlap.height() == 0.0,
                        "tiles overlap with area: {} vs {}",
                        a,
                        b
                    );
                }
            }
        }

        // Union covers the perimeter.
        let union = tiles
            .iter()
            .copied()
            .reduce(|acc, t| acc.union(&t))
            .unwrap();
        prop_assert!(union.x_min <= 0.0 && union.y_min <= 0.0);
        prop_assert!(union.x_max >= w - 1e-9 && union.y_max >= h - 1e-9);
    }
}
