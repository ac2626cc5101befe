//! Platform audio output via cpal.
//!
//! The driver contract: once per period the device callback runs the graph
//! for `nframes <= vector` frames and interleaves the sink's planar output
//! into the device buffer, in the device's sample format. The graph moves
//! into the callback closure; the host keeps a [`GraphController`] and the
//! shared parameter handles.
//!
//! [`GraphController`]: crate::message::GraphController

use crate::error::GraphError;
use crate::graph::{Graph, NodeId};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// Picks the default output device and builds the stream driving a graph.
pub struct OutputBuilder {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
}

impl OutputBuilder {
    pub fn new() -> Result<Self, GraphError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(GraphError::DeviceUnavailable)?;
        let config = device
            .default_output_config()
            .map_err(|e| GraphError::Stream(e.to_string()))?;

        log::debug!("output device config {:?}", config);
        Ok(Self { device, config })
    }

    pub fn config(&self) -> cpal::StreamConfig {
        self.config.config()
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.config().sample_rate.0 as f64
    }

    pub fn channels(&self) -> usize {
        self.config.config().channels as usize
    }

    /// Build and start the output stream. The graph must be complete; it is
    /// moved into the audio callback and pulled from `sink` every period.
    pub fn build(self, graph: Graph, sink: NodeId) -> Result<cpal::Stream, GraphError> {
        if !graph.is_ready() {
            return Err(GraphError::NotReady);
        }
        match self.config.sample_format() {
            cpal::SampleFormat::F32 => self.build_for::<f32>(graph, sink),
            cpal::SampleFormat::I16 => self.build_for::<i16>(graph, sink),
            cpal::SampleFormat::U16 => self.build_for::<u16>(graph, sink),
        }
    }

    fn build_for<T: cpal::Sample>(
        self,
        mut graph: Graph,
        sink: NodeId,
    ) -> Result<cpal::Stream, GraphError> {
        let config = self.config.config();
        let channels = config.channels as usize;

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                    render_period(&mut graph, sink, data, channels);
                },
                |err| log::warn!("output stream error: {}", err),
            )
            .map_err(|e| GraphError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| GraphError::Stream(e.to_string()))?;
        Ok(stream)
    }
}

/// Run the graph in vector-sized chunks over one device period and
/// interleave its planar output. A failing run yields silence; the device
/// always receives a full buffer.
fn render_period<T: cpal::Sample>(graph: &mut Graph, sink: NodeId, data: &mut [T], channels: usize) {
    let silence: T = cpal::Sample::from::<f32>(&0.);
    let total = data.len() / channels;
    let vector = graph.properties().vector;
    let mut offset = 0;

    while offset < total {
        let nframes = (total - offset).min(vector);
        let period = &mut data[offset * channels..(offset + nframes) * channels];

        match graph
            .run(sink, nframes)
            .and_then(|_| graph.sink_output(sink))
        {
            Ok(rendered) => {
                for (f, frame) in period.chunks_mut(channels).enumerate() {
                    for (c, sample) in frame.iter_mut().enumerate() {
                        *sample = if c < rendered.nchannels() {
                            cpal::Sample::from::<f32>(&rendered.channel(c)[f])
                        } else {
                            silence
                        };
                    }
                }
            }
            Err(_) => {
                for sample in period.iter_mut() {
                    *sample = silence;
                }
            }
        }
        offset += nframes;
    }
}
