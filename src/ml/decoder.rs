// ============================================================
// Layer 5 - Caption Decoder
// ============================================================
// Token embedding -> stacked LSTM -> linear vocabulary head.
//
// Teacher-forcing forward (forward_packed): the image embedding is
// consumed once as a priming input that leaves the initial recurrent
// state; afterwards each timestep consumes the ground-truth prefix
// token. At timestep t only the rows whose adjusted length exceeds t
// are advanced. Rows arrive sorted longest-first, so the active rows
// are always the leading prefix and the per-layer state can simply
// be sliced down as rows retire. Logits are emitted per active row
// and concatenated timestep-major, which lines them up 1:1 with
// targets packed by `packing::pack_by_timestep`.

use burn::{
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig,
        Lstm, LstmConfig, LstmState,
    },
    prelude::*,
};

use crate::data::packing::active_rows;
use crate::domain::errors::PipelineError;
use crate::infra::vocab_store::EmbeddingTable;

#[derive(Module, Debug)]
pub struct CaptionDecoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub layers: Vec<Lstm<B>>,
    pub head: Linear<B>,
    pub dropout: Dropout,
    pub hidden_size: usize,
    pub embed_dim: usize,
}

#[derive(Config, Debug)]
pub struct CaptionDecoderConfig {
    /// Full id space: unknown + words + start/end markers
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_size: usize,

    #[config(default = 1)]
    pub num_layers: usize,

    /// Dropout on the recurrent outputs feeding the head
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl CaptionDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CaptionDecoder<B> {
        let layers = (0..self.num_layers)
            .map(|i| {
                let d_input = if i == 0 { self.embed_dim } else { self.hidden_size };
                LstmConfig::new(d_input, self.hidden_size, true).init(device)
            })
            .collect();

        CaptionDecoder {
            embedding: EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device),
            layers,
            head: LinearConfig::new(self.hidden_size, self.vocab_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            hidden_size: self.hidden_size,
            embed_dim: self.embed_dim,
        }
    }
}

impl<B: Backend> CaptionDecoder<B> {
    /// Overwrite the embedding weights with a pretrained table whose
    /// rows are id-aligned (markers included).
    pub fn with_pretrained_embeddings(
        mut self,
        table: &EmbeddingTable,
        device: &B::Device,
    ) -> Result<Self, PipelineError> {
        let [vocab_size, embed_dim] = self.embedding.weight.val().dims();
        if table.rows.len() != vocab_size || table.dim != embed_dim {
            return Err(PipelineError::MissingLookup(format!(
                "embedding table is {}x{}, decoder expects {}x{}",
                table.rows.len(),
                table.dim,
                vocab_size,
                embed_dim
            )));
        }
        let flat: Vec<f32> = table.rows.iter().flatten().copied().collect();
        let weight = Tensor::<B, 1>::from_floats(flat.as_slice(), device)
            .reshape([vocab_size, embed_dim]);
        self.embedding.weight = burn::module::Param::from_tensor(weight);
        Ok(self)
    }

    /// Stop gradient flow through the embedding table.
    pub fn freeze_embeddings(mut self) -> Self {
        self.embedding = self.embedding.no_grad();
        self
    }

    /// Run the image embedding through the stack once, discarding the
    /// output and keeping the per-layer state it leaves behind.
    pub fn prime(&self, features: Tensor<B, 2>) -> Vec<LstmState<B, 2>> {
        let [batch, _] = features.dims();
        let mut x = features.reshape([batch, 1, self.embed_dim]);
        let mut states = Vec::with_capacity(self.layers.len());
        for lstm in &self.layers {
            let (out, state) = lstm.forward(x, None);
            states.push(state);
            x = out;
        }
        states
    }

    /// Advance every given row by one timestep. `x` is already
    /// embedded: [rows, 1, embed_dim]. Returns the top-layer hidden
    /// output [rows, hidden] and the updated states.
    fn step_embedded(
        &self,
        x: Tensor<B, 3>,
        states: Vec<LstmState<B, 2>>,
    ) -> (Tensor<B, 2>, Vec<LstmState<B, 2>>) {
        let [rows, _, _] = x.dims();
        let mut next = Vec::with_capacity(states.len());
        let mut x = x;
        for (lstm, state) in self.layers.iter().zip(states) {
            let (out, state) = lstm.forward(x, Some(state));
            next.push(state);
            x = out;
        }
        (x.reshape([rows, self.hidden_size]), next)
    }

    /// One greedy-decoding step from token ids [rows, 1]: embed,
    /// advance, project to vocabulary logits [rows, vocab].
    pub fn step(
        &self,
        tokens: Tensor<B, 2, Int>,
        states: Vec<LstmState<B, 2>>,
    ) -> (Tensor<B, 2>, Vec<LstmState<B, 2>>) {
        let embedded = self.embedding.forward(tokens);
        let (hidden, states) = self.step_embedded(embedded, states);
        (self.head.forward(hidden), states)
    }

    /// Packed teacher-forcing forward.
    ///
    /// `prefix` is the caption matrix with the final column dropped;
    /// `lengths` are the adjusted (true - 1) lengths, sorted
    /// non-increasing. Produces exactly sum(lengths) logit rows in
    /// timestep-major order.
    pub fn forward_packed(
        &self,
        features: Tensor<B, 2>,
        prefix: Tensor<B, 2, Int>,
        lengths: &[usize],
    ) -> Result<Tensor<B, 2>, PipelineError> {
        let [batch, prefix_len] = prefix.dims();
        if batch != lengths.len() {
            return Err(PipelineError::InvalidBatch(format!(
                "{batch} prefix rows but {} lengths",
                lengths.len()
            )));
        }
        for (row, window) in lengths.windows(2).enumerate() {
            if window[1] > window[0] {
                return Err(PipelineError::InvalidBatch(format!(
                    "adjusted lengths not sorted descending at rows {}..{}",
                    row,
                    row + 1
                )));
            }
        }
        for (row, &len) in lengths.iter().enumerate() {
            if len == 0 {
                // a caption of fewer than 2 real tokens
                return Err(PipelineError::InvalidCaption { row, len: 1 });
            }
        }
        let max_steps = lengths[0];
        if max_steps > prefix_len {
            return Err(PipelineError::InvalidBatch(format!(
                "longest adjusted length {max_steps} exceeds prefix width {prefix_len}"
            )));
        }

        let embedded = self.embedding.forward(prefix);
        let mut states = self.prime(features);

        let mut logits = Vec::with_capacity(max_steps);
        for step in 0..max_steps {
            let active = active_rows(lengths, step);
            let input = embedded
                .clone()
                .slice([0..active, step..step + 1, 0..self.embed_dim]);
            let sliced: Vec<LstmState<B, 2>> = states
                .iter()
                .map(|s| {
                    LstmState::new(
                        s.cell.clone().slice([0..active, 0..self.hidden_size]),
                        s.hidden.clone().slice([0..active, 0..self.hidden_size]),
                    )
                })
                .collect();
            let (hidden, next_states) = self.step_embedded(input, sliced);
            states = next_states;
            logits.push(self.head.forward(self.dropout.forward(hidden)));
        }

        Ok(Tensor::cat(logits, 0))
    }
}
