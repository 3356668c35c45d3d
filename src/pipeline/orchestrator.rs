//! Run orchestration
//!
//! A run walks through [`RunState`] in order and ends in `Done` or
//! `Errored`. Per-note work fans out into a `JoinSet`: metadata extraction
//! runs on the blocking pool while the text chain (extraction, correction,
//! structure, scoring) runs on the async side. Stage failures are resolved
//! through the table in [`super::fallback`], so [`Pipeline::process`] always
//! returns an output.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fallback::{Diagnostics, FallbackAction, Stage};
use super::output::{
    split_analysis, ImageMetadata, NoteResult, NoteStatus, NoteText, ProcessingDetails,
    ProcessingOutput, RunStatus, Summary,
};
use super::{LayoutHint, ProcessingOptions, ProcessingRequest};
use crate::analysis::{
    score, structure_clarity, ConfidenceReport, PatternTables, PostProcessor, StructureAnalysis,
    StructureRecognizer, TextNormalizer,
};
use crate::capture::ingest;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::shared::CallPolicy;
use crate::vision::{
    CodeDecoder, HttpOcrClient, MetadataExtractor, OpenAiVisionClient, PreprocessedImage,
    Preprocessor, QrCodeDecoder, QualityMetrics, SeparatedNote, Separator, TextExtractor,
    TextRecognizer, VisionModel,
};

/// Where a run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Validating,
    Preprocessing,
    Separating,
    PerNoteProcessing,
    Aggregating,
    Done,
    /// Absorbing; entered on a critical failure
    Errored,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Done | Errored, _) => false,
            (_, Errored) => true,
            (Validating, Preprocessing)
            | (Preprocessing, Separating)
            | (Separating, PerNoteProcessing)
            | (PerNoteProcessing, Aggregating)
            | (Aggregating, Done) => true,
            _ => false,
        }
    }
}

struct Run {
    id: Uuid,
    started: Instant,
    state: RunState,
    diagnostics: Diagnostics,
}

impl Run {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            state: RunState::Validating,
            diagnostics: Diagnostics::default(),
        }
    }

    fn advance(&mut self, next: RunState) {
        if !self.state.can_advance_to(next) {
            warn!("Run {}: ignoring transition {:?} -> {:?}", self.id, self.state, next);
            return;
        }
        debug!(
            "Run {}: {:?} -> {:?} at {} ms",
            self.id,
            self.state,
            next,
            self.started.elapsed().as_millis()
        );
        self.state = next;
    }

    fn fail(&mut self, stage: Stage, err: &PipelineError) {
        if self.diagnostics.record(stage, err) == FallbackAction::AbortRun {
            self.advance(RunState::Errored);
        }
    }
}

/// What the stages produced before aggregation
#[derive(Default)]
struct Artifacts {
    image_metadata: Option<ImageMetadata>,
    quality: Option<QualityMetrics>,
    processing_applied: Vec<String>,
    notes: Vec<NoteResult>,
}

/// The digitization pipeline
///
/// Holds the immutable configuration, the compiled pattern tables and the
/// external service clients. Cheap to share; every run works on its own data.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    patterns: Arc<PatternTables>,
    normalizer: Arc<TextNormalizer>,
    recognizer: Option<Arc<dyn TextRecognizer>>,
    vision: Option<Arc<dyn VisionModel>>,
    decoder: Arc<dyn CodeDecoder>,
}

impl Pipeline {
    /// Pipeline without external services; add them with the `with_*` methods
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            patterns: Arc::new(PatternTables::compile()?),
            normalizer: Arc::new(TextNormalizer::compile()?),
            recognizer: None,
            vision: None,
            decoder: Arc::new(QrCodeDecoder),
        })
    }

    /// Pipeline with the HTTP clients the configuration describes. A client
    /// that cannot be built is left out with a warning.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let mut pipeline = Self::new(config)?;

        match HttpOcrClient::from_config(&pipeline.config.services.ocr) {
            Ok(client) => {
                info!("Traditional OCR: {}", client.name());
                pipeline.recognizer = Some(Arc::new(client));
            }
            Err(e) => warn!("Traditional OCR unavailable: {}", e),
        }

        match OpenAiVisionClient::from_config(&pipeline.config.services.vision) {
            Ok(client) => {
                info!("Vision model: {}", client.model_name());
                pipeline.vision = Some(Arc::new(client));
            }
            Err(e) => warn!("Vision model unavailable: {}", e),
        }

        Ok(pipeline)
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(model);
        self
    }

    pub fn with_code_decoder(mut self, decoder: Arc<dyn CodeDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one photo
    pub async fn process(&self, request: ProcessingRequest) -> ProcessingOutput {
        self.process_with_cancel(request, CancellationToken::new()).await
    }

    /// Process one photo until done or until `cancel` fires, whichever is
    /// first. Notes finished by then are returned as a partial result.
    pub async fn process_with_cancel(
        &self,
        request: ProcessingRequest,
        cancel: CancellationToken,
    ) -> ProcessingOutput {
        let mut run = Run::new();
        info!(
            "Run {} started: {} bytes of {}, mode {}",
            run.id,
            request.image.len(),
            request.format,
            request.options.ocr_mode
        );

        let run_cancel = cancel.child_token();
        let deadline = self.config.services.run_timeout_ms.map(|ms| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                token.cancel();
            })
        });

        let mut artifacts = Artifacts::default();
        self.run_stages(&mut run, request, &cancel, &run_cancel, &mut artifacts)
            .await;
        if let Some(timer) = deadline {
            timer.abort();
        }

        self.aggregate(run, artifacts)
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        request: ProcessingRequest,
        caller: &CancellationToken,
        cancel: &CancellationToken,
        out: &mut Artifacts,
    ) {
        let ProcessingRequest {
            image,
            format,
            options,
        } = request;

        let ingested = match ingest(image, format, &self.config.validation) {
            Ok(ingested) => ingested,
            Err(err) => {
                run.fail(Stage::Validation, &err.into());
                return;
            }
        };
        out.image_metadata = Some(ImageMetadata::from_ingested(&ingested));

        run.advance(RunState::Preprocessing);
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let decoded = ingested.decoded;
        let prepared = tokio::task::spawn_blocking(move || {
            Preprocessor::new(&config.preprocess).prepare(&decoded)
        })
        .await;
        let (pre, quality) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                run.fail(Stage::Preprocessing, &err.into());
                return;
            }
        };
        info!(
            "Preprocessed in {} ms: quality {:.2}, steps {:?}",
            started.elapsed().as_millis(),
            quality.overall,
            pre.steps_applied
        );
        out.quality = Some(quality);
        out.processing_applied = pre.steps_applied.clone();
        let pre = Arc::new(pre);

        run.advance(RunState::Separating);
        let mut notes = self.separate(run, &pre, options.layout_hint).await;
        if let Some(max_notes) = options.max_notes {
            let max_notes = max_notes.max(1);
            if notes.len() > max_notes {
                run.diagnostics.warn(format!(
                    "{} notes found, processing only the first {}",
                    notes.len(),
                    max_notes
                ));
                notes.truncate(max_notes);
            }
        }

        run.advance(RunState::PerNoteProcessing);
        out.notes = self
            .process_notes(run, notes, &options, quality.overall, &pre.steps_applied, caller, cancel)
            .await;
    }

    async fn separate(
        &self,
        run: &mut Run,
        pre: &Arc<PreprocessedImage>,
        hint: Option<LayoutHint>,
    ) -> Vec<SeparatedNote> {
        let started = Instant::now();
        let config = Arc::clone(&self.config);
        let image = Arc::clone(pre);
        let separated = tokio::task::spawn_blocking(move || -> Result<Vec<SeparatedNote>> {
            let separator = Separator::new(&config.separation);
            let notes = separator.separate(&image)?;
            Ok(match hint {
                Some(LayoutHint::Grid3x3) if notes.len() < 9 => {
                    info!("{} region(s) found, splitting along the 3x3 layout", notes.len());
                    separator.grid(&image, 3, 3)
                }
                _ if notes.is_empty() => {
                    info!("No note regions found, treating the whole image as one note");
                    vec![separator.whole_image(&image)]
                }
                _ => notes,
            })
        })
        .await;
        let separated: Result<Vec<SeparatedNote>> = match separated {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };

        match separated {
            Ok(notes) => {
                info!(
                    "Separated {} note(s) in {} ms",
                    notes.len(),
                    started.elapsed().as_millis()
                );
                notes
            }
            Err(err) => match run.diagnostics.record(Stage::Separation, &err) {
                FallbackAction::ProcessAsSingleNote => {
                    vec![Separator::new(&self.config.separation).whole_image(pre)]
                }
                _ => Vec::new(),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_notes(
        &self,
        run: &mut Run,
        notes: Vec<SeparatedNote>,
        options: &ProcessingOptions,
        image_quality: f32,
        steps: &[String],
        caller: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Vec<NoteResult> {
        let total = notes.len();
        let limiter = Arc::new(Semaphore::new(self.config.services.max_concurrent_notes.max(1)));
        let mut tasks = JoinSet::new();

        for (index, note) in notes.into_iter().enumerate() {
            let worker = NoteWorker {
                config: Arc::clone(&self.config),
                patterns: Arc::clone(&self.patterns),
                normalizer: Arc::clone(&self.normalizer),
                recognizer: self.recognizer.clone(),
                vision: self.vision.clone(),
                decoder: Arc::clone(&self.decoder),
                options: options.clone(),
                image_quality,
                steps: steps.to_vec(),
                cancel: cancel.clone(),
            };
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                (index, worker.run(note).await)
            });
        }

        let mut slots: Vec<Option<NoteResult>> = (0..total).map(|_| None).collect();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok((index, Ok(result))) = joined {
                            slots[index] = Some(result);
                        }
                    }
                    let reason = if caller.is_cancelled() {
                        "run cancelled"
                    } else {
                        "run deadline exceeded"
                    };
                    let completed = slots.iter().filter(|s| s.is_some()).count();
                    run.diagnostics.degraded = true;
                    run.diagnostics
                        .warn(format!("{reason}: {completed} of {total} note(s) completed"));
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((index, Ok(result)))) => slots[index] = Some(result),
                    Some(Ok((index, Err(err)))) => debug!("Note {} stopped: {}", index + 1, err),
                    Some(Err(err)) => {
                        run.diagnostics.degraded = true;
                        run.diagnostics.warn(format!("a note task died: {err}"));
                    }
                },
            }
        }

        slots.into_iter().flatten().collect()
    }

    fn aggregate(&self, mut run: Run, artifacts: Artifacts) -> ProcessingOutput {
        let errored = run.state == RunState::Errored;
        if !errored {
            run.advance(RunState::Aggregating);
        }

        for note in &artifacts.notes {
            for warning in &note.warnings {
                run.diagnostics
                    .warnings
                    .push(format!("{}: {}", note.note_id, warning));
            }
        }

        let status = run_status(&run.diagnostics, &artifacts.notes);
        let summary = Summary::from_notes(&artifacts.notes, status);
        if !errored {
            run.advance(RunState::Done);
        }

        let processing_time_ms = run.started.elapsed().as_millis() as u64;
        info!(
            "Run {} finished in {} ms: {:?}, {} note(s), {} warning(s), {} error(s)",
            run.id,
            processing_time_ms,
            status,
            summary.total_notes,
            run.diagnostics.warnings.len(),
            run.diagnostics.errors.len()
        );

        ProcessingOutput {
            run_id: run.id,
            processed_at: Utc::now(),
            processing_time_ms,
            image_metadata: artifacts.image_metadata,
            quality: artifacts.quality,
            processing_applied: artifacts.processing_applied,
            notes: artifacts.notes,
            summary,
            errors: run.diagnostics.errors,
            warnings: run.diagnostics.warnings,
        }
    }
}

fn run_status(diagnostics: &Diagnostics, notes: &[NoteResult]) -> RunStatus {
    if diagnostics.aborted
        || notes.is_empty()
        || notes.iter().all(|n| n.status == NoteStatus::Failed)
    {
        RunStatus::Failed
    } else if diagnostics.degraded || notes.iter().any(|n| n.status != NoteStatus::Success) {
        RunStatus::PartialSuccess
    } else {
        RunStatus::Success
    }
}

/// Text-side results of one note
struct TextOutcome {
    text: NoteText,
    analysis: StructureAnalysis,
    report: ConfidenceReport,
    details: ProcessingDetails,
    diagnostics: Diagnostics,
    failed: bool,
}

/// Everything one note branch owns
struct NoteWorker {
    config: Arc<PipelineConfig>,
    patterns: Arc<PatternTables>,
    normalizer: Arc<TextNormalizer>,
    recognizer: Option<Arc<dyn TextRecognizer>>,
    vision: Option<Arc<dyn VisionModel>>,
    decoder: Arc<dyn CodeDecoder>,
    options: ProcessingOptions,
    image_quality: f32,
    steps: Vec<String>,
    cancel: CancellationToken,
}

impl NoteWorker {
    /// Fails only with [`PipelineError::Cancelled`]
    async fn run(self, note: SeparatedNote) -> Result<NoteResult> {
        let started = Instant::now();
        let note = Arc::new(note);

        let metadata_task = {
            let config = Arc::clone(&self.config);
            let decoder = Arc::clone(&self.decoder);
            let note = Arc::clone(&note);
            tokio::task::spawn_blocking(move || {
                MetadataExtractor::new(&config.metadata, decoder.as_ref()).extract(&note)
            })
        };
        let (metadata, text) = tokio::join!(metadata_task, self.text_chain(&note));
        let outcome = text?;

        let mut diagnostics = outcome.diagnostics;
        let metadata = match metadata {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        };
        let visual_metadata = match metadata {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                diagnostics.record(Stage::MetadataExtraction, &err);
                None
            }
        };

        let status = if outcome.failed {
            NoteStatus::Failed
        } else if diagnostics.is_clean() {
            NoteStatus::Success
        } else {
            NoteStatus::Partial
        };

        let mut details = outcome.details;
        details.steps_applied = self.steps.clone();
        details.processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            "{} done in {} ms: {:?}, confidence {:.2}",
            note.note_id,
            details.processing_time_ms,
            status,
            outcome.report.overall
        );

        let (structure, tags) = split_analysis(outcome.analysis);
        Ok(NoteResult {
            note_id: note.note_id.clone(),
            status,
            bounding_box: note.bounding_box,
            relative_position: note.relative_position,
            rotation_angle: note.rotation_angle,
            detection_method: note.detection_method,
            detection_confidence: note.detection_confidence,
            visual_metadata,
            text: outcome.text,
            structure,
            tags,
            confidence_report: outcome.report,
            processing_details: details,
            warnings: diagnostics.warnings,
            errors: diagnostics.errors,
        })
    }

    /// Extraction, correction, structure and scoring, strictly in that order
    async fn text_chain(&self, note: &SeparatedNote) -> Result<TextOutcome> {
        let cfg = &*self.config;
        let mut diagnostics = Diagnostics::default();

        let extractor = TextExtractor::new(
            &cfg.extraction,
            &cfg.services,
            self.recognizer.as_deref(),
            self.vision.as_deref(),
        );
        let extraction = match extractor
            .extract(note, self.options.ocr_mode, self.image_quality, &self.cancel)
            .await
        {
            Ok(extraction) => extraction,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                diagnostics.record(Stage::TextExtraction, &err);
                return Ok(self.failed_outcome(diagnostics));
            }
        };
        for warning in &extraction.warnings {
            diagnostics.warn(warning.clone());
        }

        let vision_policy = CallPolicy::for_vision(&cfg.services.vision, cfg.services.retry_backoff_ms);
        let post = PostProcessor::new(&cfg.postprocess, &self.patterns, &self.normalizer)
            .process(
                &extraction.merged.text,
                Some(&extraction.word_confidences),
                self.vision.as_deref(),
                &vision_policy,
                &self.cancel,
            )
            .await;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(message) = &post.correction_error {
            diagnostics.record(Stage::PostProcessing, &PipelineError::Correction(message.clone()));
        }
        for warning in &post.warnings {
            diagnostics.warn(warning.clone());
        }

        // Structure always comes from the final text
        let recognizer = StructureRecognizer::new(&cfg.structure, &self.patterns);
        let mut analysis = recognizer.analyze(&post.text, note);
        if recognizer.wants_title_hint(&analysis, &post.text) {
            if let Some(model) = self.vision.as_deref() {
                match recognizer
                    .suggest_title(model, &post.text, &vision_policy, &self.cancel)
                    .await
                {
                    Ok(Some(title)) => recognizer.apply_title(&mut analysis, &post.text, title),
                    Ok(None) => {}
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(err) => {
                        diagnostics.record(Stage::StructureRecognition, &err);
                    }
                }
            }
        }

        let clarity = structure_clarity(&analysis, &cfg.scoring.clarity);
        let report = score(
            self.image_quality,
            extraction.merged.confidence,
            clarity,
            &cfg.scoring,
        )
        .with_methods(
            extraction.traditional.as_ref().map(|r| r.confidence),
            extraction.vision.as_ref().map(|r| r.confidence),
        );
        if let Some(threshold) = self.options.confidence_threshold {
            if report.overall < threshold {
                diagnostics.warn(format!(
                    "overall confidence {:.2} is below the threshold {:.2}",
                    report.overall, threshold
                ));
            }
        }

        let details = ProcessingDetails {
            extraction_strategy: Some(extraction.strategy),
            ocr_engine: extraction.ocr_engine.clone(),
            vision_model: extraction.vision_model.clone(),
            differences: extraction.differences.clone(),
            correction_candidates: post.candidates.len(),
            corrections_applied: post.applied_count(),
            corrections: post.corrections,
            ..ProcessingDetails::default()
        };
        let text = NoteText {
            raw: extraction.merged.text,
            formatted: post.formatted,
            extraction_method: Some(extraction.merged.source),
            confidence: extraction.merged.confidence,
            traditional: extraction.traditional.map(|r| r.text),
            vision: extraction.vision.map(|r| r.text),
            illegible_regions: extraction.merged.illegible_regions,
        };

        Ok(TextOutcome {
            text,
            analysis,
            report,
            details,
            diagnostics,
            failed: false,
        })
    }

    /// Outcome of a note whose text could not be read at all
    fn failed_outcome(&self, diagnostics: Diagnostics) -> TextOutcome {
        TextOutcome {
            text: NoteText::default(),
            analysis: StructureAnalysis::default(),
            report: score(self.image_quality, 0.0, 0.0, &self.config.scoring),
            details: ProcessingDetails::default(),
            diagnostics,
            failed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encode_png;
    use crate::capture::frame::ImageFormat;
    use crate::vision::ocr::{OcrOutput, OcrWord};
    use crate::vision::vision_model::{QualitativeConfidence, VisionTranscription};
    use crate::vision::{DetectionMethod, OcrMode};
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};

    const NOTE_TEXT: &str = "## Groceries ##\n- milk\n- eggs";

    struct FakeRecognizer;

    #[async_trait]
    impl TextRecognizer for FakeRecognizer {
        fn name(&self) -> &str {
            "fake-ocr"
        }

        async fn recognize(&self, _image: &RgbImage) -> Result<OcrOutput> {
            let words = NOTE_TEXT
                .lines()
                .enumerate()
                .flat_map(|(line, text)| {
                    text.split_whitespace().map(move |w| OcrWord {
                        text: w.to_string(),
                        confidence: 0.95,
                        bounds: None,
                        line,
                    })
                })
                .collect();
            Ok(OcrOutput::from_words(words))
        }
    }

    /// Reads "buy rnilk" with little confidence in the second word
    struct UnsureRecognizer;

    #[async_trait]
    impl TextRecognizer for UnsureRecognizer {
        fn name(&self) -> &str {
            "unsure-ocr"
        }

        async fn recognize(&self, _image: &RgbImage) -> Result<OcrOutput> {
            let word = |text: &str, confidence| OcrWord {
                text: text.to_string(),
                confidence,
                bounds: None,
                line: 0,
            };
            Ok(OcrOutput::from_words(vec![word("buy", 0.95), word("rnilk", 0.4)]))
        }
    }

    enum VisionBehavior {
        Transcribe,
        Fail,
        Hang,
    }

    struct FakeVision(VisionBehavior);

    #[async_trait]
    impl VisionModel for FakeVision {
        fn model_name(&self) -> &str {
            "fake-vision"
        }

        async fn transcribe(&self, _image: &RgbImage) -> Result<VisionTranscription> {
            match self.0 {
                VisionBehavior::Transcribe => Ok(VisionTranscription {
                    text: NOTE_TEXT.to_string(),
                    confidence: QualitativeConfidence::High,
                    illegible_regions: Vec::new(),
                }),
                // Not retryable, so the policy gives up at once
                VisionBehavior::Fail => Err(PipelineError::Config("vision offline".into())),
                VisionBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(PipelineError::Config("woke up".into()))
                }
            }
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok("NONE".to_string())
        }
    }

    fn pipeline(vision: VisionBehavior) -> Pipeline {
        Pipeline::new(PipelineConfig::default())
            .unwrap()
            .with_recognizer(Arc::new(FakeRecognizer))
            .with_vision_model(Arc::new(FakeVision(vision)))
    }

    fn png(img: RgbImage) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    fn grid_photo() -> Vec<u8> {
        let colors = [
            Rgb([250, 235, 110]),
            Rgb([250, 180, 200]),
            Rgb([140, 190, 240]),
            Rgb([170, 230, 170]),
            Rgb([250, 180, 90]),
            Rgb([245, 245, 245]),
            Rgb([190, 190, 190]),
            Rgb([200, 170, 230]),
            Rgb([250, 250, 180]),
        ];
        let mut img = RgbImage::from_pixel(900, 900, Rgb([45, 45, 50]));
        for (i, color) in colors.iter().enumerate() {
            let (x0, y0) = (30 + (i as u32 % 3) * 290, 30 + (i as u32 / 3) * 290);
            for y in y0..y0 + 240 {
                for x in x0..x0 + 240 {
                    img.put_pixel(x, y, *color);
                }
            }
            for line in 0..3 {
                let ly = y0 + 60 + line * 48;
                for x in x0 + 40..x0 + 200 {
                    for t in 0..3 {
                        img.put_pixel(x, ly + t, Rgb([30, 30, 30]));
                    }
                }
            }
        }
        png(img)
    }

    fn blank_photo() -> Vec<u8> {
        png(RgbImage::from_pixel(300, 300, Rgb([250, 235, 110])))
    }

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Validating.can_advance_to(Preprocessing));
        assert!(PerNoteProcessing.can_advance_to(Aggregating));
        assert!(Separating.can_advance_to(Errored));
        assert!(!Validating.can_advance_to(Separating));
        assert!(!Errored.can_advance_to(Aggregating));
        assert!(!Done.can_advance_to(Errored));
    }

    #[tokio::test]
    async fn test_grid_photo_end_to_end() {
        let output = pipeline(VisionBehavior::Transcribe)
            .process(ProcessingRequest::new(grid_photo(), ImageFormat::Png))
            .await;

        // Nine separate notes; one merge or split is tolerated
        let total = output.summary.total_notes;
        assert!((8..=10).contains(&total), "found {total} notes");
        assert_eq!(output.notes.len(), total);
        assert_ne!(output.summary.status, RunStatus::Failed);
        assert!(output.errors.is_empty());

        let meta = output.image_metadata.as_ref().unwrap();
        assert_eq!((meta.dimensions.width, meta.dimensions.height), (900, 900));
        assert_eq!(meta.sha256.len(), 64);

        let overlap = PipelineConfig::default().separation.overlap_threshold;
        for (i, a) in output.notes.iter().enumerate() {
            assert_ne!(a.status, NoteStatus::Failed);
            assert!(a.text.raw.contains("milk"));
            assert!(a.structure.has_title);
            assert!(a.structure.has_lists);
            assert!(a.visual_metadata.is_some());
            assert!((0.0..=1.0).contains(&a.confidence_report.overall));
            for b in output.notes.iter().skip(i + 1) {
                assert!(a.bounding_box.iou(&b.bounding_box) <= overlap);
            }
        }
        assert!(output.summary.average_confidence > 0.0);
    }

    #[tokio::test]
    async fn test_vision_failure_in_vision_mode_is_not_success() {
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                ocr_mode: OcrMode::Vision,
                ..ProcessingOptions::default()
            },
        );
        let output = pipeline(VisionBehavior::Fail).process(request).await;

        assert_eq!(output.notes.len(), 1);
        let note = &output.notes[0];
        assert_ne!(note.status, NoteStatus::Success);
        assert!(!note.warnings.is_empty());
        assert_eq!(note.text.extraction_method, None);
        assert!(!output.warnings.is_empty());
        assert_ne!(output.summary.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_validation_failure_aborts() {
        let output = pipeline(VisionBehavior::Transcribe)
            .process(ProcessingRequest::new(vec![0u8; 64], ImageFormat::Png))
            .await;

        assert_eq!(output.summary.status, RunStatus::Failed);
        assert_eq!(output.errors.len(), 1);
        assert!(output.errors[0].starts_with("validation"));
        assert!(output.notes.is_empty());
        assert!(output.image_metadata.is_none());
    }

    #[tokio::test]
    async fn test_blank_photo_becomes_single_note() {
        let output = pipeline(VisionBehavior::Transcribe)
            .process(ProcessingRequest::new(blank_photo(), ImageFormat::Png))
            .await;

        assert_eq!(output.summary.total_notes, 1);
        let note = &output.notes[0];
        assert_eq!(note.detection_method, DetectionMethod::FullImage);
        assert_eq!(note.note_id, "note_001");
        assert_ne!(note.status, NoteStatus::Failed);
        assert!(!note.text.formatted.is_empty());
    }

    #[tokio::test]
    async fn test_layout_hint_forces_grid() {
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                layout_hint: Some(LayoutHint::Grid3x3),
                max_notes: Some(4),
                ..ProcessingOptions::default()
            },
        );
        let output = pipeline(VisionBehavior::Transcribe).process(request).await;

        assert_eq!(output.notes.len(), 4);
        assert!(output
            .notes
            .iter()
            .all(|n| n.detection_method == DetectionMethod::Grid));
        assert!(output.warnings.iter().any(|w| w.contains("first 4")));
    }

    #[tokio::test]
    async fn test_confidence_threshold_marks_partial() {
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                confidence_threshold: Some(1.5),
                ..ProcessingOptions::default()
            },
        );
        let output = pipeline(VisionBehavior::Transcribe).process(request).await;

        assert_eq!(output.notes[0].status, NoteStatus::Partial);
        assert_eq!(output.summary.status, RunStatus::PartialSuccess);
        assert!(output
            .warnings
            .iter()
            .any(|w| w.starts_with("note_001: overall confidence")));
    }

    #[tokio::test]
    async fn test_failed_correction_returns_uncorrected_text() {
        // The fake model answers "NONE", which is not a correction list
        let pipeline = Pipeline::new(PipelineConfig::default())
            .unwrap()
            .with_recognizer(Arc::new(UnsureRecognizer))
            .with_vision_model(Arc::new(FakeVision(VisionBehavior::Transcribe)));
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                ocr_mode: OcrMode::Traditional,
                ..ProcessingOptions::default()
            },
        );
        let output = pipeline.process(request).await;

        let note = &output.notes[0];
        assert_eq!(note.text.formatted, "buy rnilk");
        assert_eq!(note.processing_details.corrections_applied, 0);
        assert_eq!(note.status, NoteStatus::Partial);
        assert!(note
            .warnings
            .iter()
            .any(|w| w.starts_with("post-processing: text correction failed")));
        assert_eq!(output.summary.status, RunStatus::PartialSuccess);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                ocr_mode: OcrMode::Vision,
                ..ProcessingOptions::default()
            },
        );
        let pipeline = pipeline(VisionBehavior::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let output = tokio::time::timeout(
            Duration::from_secs(30),
            pipeline.process_with_cancel(request, cancel),
        )
        .await
        .expect("run did not stop after cancellation");

        assert!(output.notes.is_empty());
        assert_eq!(output.summary.status, RunStatus::Failed);
        assert!(output.warnings.iter().any(|w| w.starts_with("run cancelled")));
    }

    #[tokio::test]
    async fn test_run_deadline() {
        let mut config = PipelineConfig::default();
        config.services.run_timeout_ms = Some(200);
        let pipeline = Pipeline::new(config)
            .unwrap()
            .with_vision_model(Arc::new(FakeVision(VisionBehavior::Hang)));
        let request = ProcessingRequest::new(blank_photo(), ImageFormat::Png).with_options(
            ProcessingOptions {
                ocr_mode: OcrMode::Vision,
                ..ProcessingOptions::default()
            },
        );

        let output = tokio::time::timeout(Duration::from_secs(30), pipeline.process(request))
            .await
            .expect("deadline was not enforced");
        assert!(output
            .warnings
            .iter()
            .any(|w| w.starts_with("run deadline exceeded")));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.scoring.image_weight = 0.9;
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::Config(_))
        ));
    }
}
