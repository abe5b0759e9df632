//! Tests for the command handlers.

#[cfg(test)]
mod tests {
    use crate::commands::ShowFormat;
    use crate::handlers;

    use gantry_core::JobGraph;
    use gantry_pipeline::{Phase, PipelineDocument};
    use pretty_assertions::assert_eq;

    fn scaffold() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        handlers::init(dir.path()).expect("init");
        dir
    }

    #[test]
    fn test_init_scaffolds_loadable_definition() {
        let dir = scaffold();

        let text = handlers::phase_text(
            dir.path(),
            "defaults",
            Phase::FullJobGraph,
            ShowFormat::Labels,
            None,
        )
        .expect("generate");
        assert_eq!(text, "build\nunit-tests");
    }

    #[test]
    fn test_init_leaves_existing_definition_alone() {
        let dir = scaffold();
        let marker = dir.path().join("config.yml");
        std::fs::write(&marker, "root_stage: somewhere\n").expect("overwrite config");

        handlers::init(dir.path()).expect("second init");
        let text = std::fs::read_to_string(&marker).expect("read config");
        assert_eq!(text, "root_stage: somewhere\n");
    }

    #[test]
    fn test_phase_text_yaml_round_trips() {
        let dir = scaffold();

        let text = handlers::phase_text(
            dir.path(),
            "defaults",
            Phase::OptimizedJobGraph,
            ShowFormat::Yaml,
            None,
        )
        .expect("generate");
        let job_graph: JobGraph = serde_yaml::from_str(&text).expect("parse job graph");
        assert_eq!(
            job_graph.labels().collect::<Vec<_>>(),
            vec!["build", "unit-tests"]
        );
        assert_eq!(job_graph.graph().edge_count(), 1);
    }

    #[test]
    fn test_phase_text_jobs_regex_narrows_output() {
        let dir = scaffold();

        let text = handlers::phase_text(
            dir.path(),
            "defaults",
            Phase::FullJobGraph,
            ShowFormat::Labels,
            Some("^unit"),
        )
        .expect("generate");
        assert_eq!(text, "unit-tests");
    }

    #[test]
    fn test_phase_text_rejects_invalid_jobs_regex() {
        let dir = scaffold();

        let err = handlers::phase_text(
            dir.path(),
            "defaults",
            Phase::FullJobGraph,
            ShowFormat::Labels,
            Some("["),
        )
        .expect_err("invalid pattern");
        assert!(err.to_string().contains("invalid jobs filter"), "{err}");
    }

    #[test]
    fn test_decision_writes_all_artifacts() {
        let dir = scaffold();
        let out = dir.path().join("artifacts");

        handlers::decision(dir.path(), "defaults", &out).expect("decision");

        for name in [
            "parameters.yml",
            "full-job-graph.yml",
            "target-jobs.yml",
            "optimized-job-graph.yml",
            "pipeline.yml",
        ] {
            assert!(out.join(name).exists(), "missing artifact {name}");
        }

        let pipeline_text = std::fs::read_to_string(out.join("pipeline.yml")).expect("read");
        let pipeline: PipelineDocument =
            serde_yaml::from_str(&pipeline_text).expect("parse pipeline");
        assert_eq!(pipeline.stages, vec!["build", "test"]);
        assert_eq!(pipeline.jobs.len(), 2);

        let optimized_text =
            std::fs::read_to_string(out.join("optimized-job-graph.yml")).expect("read");
        let optimized: JobGraph = serde_yaml::from_str(&optimized_text).expect("parse job graph");
        assert_eq!(optimized.len(), 2);
    }

    #[test]
    fn test_show_rejects_unknown_phase() {
        let dir = scaffold();

        let err = handlers::show(
            "nonsense",
            dir.path(),
            &["defaults".to_string()],
            ShowFormat::Labels,
            None,
        )
        .expect_err("unknown phase");
        assert!(err.to_string().contains("unknown phase"), "{err}");
    }

    #[test]
    fn test_show_runs_each_parameter_set() {
        let dir = scaffold();

        handlers::show(
            "full_job_graph",
            dir.path(),
            &["defaults".to_string(), "defaults".to_string()],
            ShowFormat::Labels,
            None,
        )
        .expect("parallel show");
    }
}
