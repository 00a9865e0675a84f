//! Grammar compiler with a byte-bounded LRU cache.
//!
//! `GrammarCompiler` turns grammars (or their sources: JSON Schema, regex,
//! structural tags) into shared [`CompiledGrammar`]s for one tokenizer.
//! Compiled grammars are cached by the canonical EBNF text of the grammar,
//! so compiling the same grammar twice yields the same `Arc`.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

use crate::compiled_grammar::CompiledGrammar;
use crate::error::{err, Result};
use crate::grammar::Grammar;
use crate::json_schema::JsonSchemaOptions;
use crate::tokenizer::TokenizerInfo;

/// Compiler construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Worker threads for token mask precomputation.
    pub max_threads: usize,
    /// Cache compiled grammars.
    pub cache_enabled: bool,
    /// Upper bound on the summed `memory_size` of cached grammars.
    /// `None` or `Some(0)` = unlimited.
    pub max_memory_bytes: Option<usize>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            max_threads: 8,
            cache_enabled: true,
            max_memory_bytes: None,
        }
    }
}

struct CompileCache {
    /// Compiled grammar and its size when inserted.
    entries: LruCache<String, (Arc<CompiledGrammar>, usize)>,
    total_bytes: usize,
}

/// Compiles grammars against one tokenizer and caches the results.
pub struct GrammarCompiler {
    tokenizer_info: Arc<TokenizerInfo>,
    options: CompilerOptions,
    pool: rayon::ThreadPool,
    cache: Mutex<CompileCache>,
    builtin_json: OnceLock<Arc<CompiledGrammar>>,
}

impl GrammarCompiler {
    pub fn new(tokenizer_info: Arc<TokenizerInfo>, options: CompilerOptions) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_threads.max(1))
            .thread_name(|i| format!("grammar-compile-{}", i))
            .build()
            .map_err(|e| err!(Runtime, "failed to start compiler thread pool: {}", e))?;
        Ok(Self {
            tokenizer_info,
            options,
            pool,
            cache: Mutex::new(CompileCache {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            builtin_json: OnceLock::new(),
        })
    }

    pub fn tokenizer_info(&self) -> &Arc<TokenizerInfo> {
        &self.tokenizer_info
    }

    /// Compile a grammar, reusing a cached result when one exists.
    pub fn compile_grammar(&self, grammar: &Grammar) -> Result<Arc<CompiledGrammar>> {
        if !self.options.cache_enabled {
            return self.compile_uncached(grammar);
        }

        let key = grammar.cache_key();
        if let Some((hit, _)) = self.cache.lock().entries.get(&key) {
            tracing::debug!(rules = grammar.num_rules(), "compiled grammar cache hit");
            return Ok(hit.clone());
        }
        tracing::debug!(rules = grammar.num_rules(), "compiled grammar cache miss");

        // Compile without holding the lock
        let compiled = self.compile_uncached(grammar)?;
        Ok(self.insert(key, compiled))
    }

    pub fn compile_json_schema(&self, schema: &str, options: &JsonSchemaOptions) -> Result<Arc<CompiledGrammar>> {
        let grammar = Grammar::from_json_schema(schema, options)?;
        self.compile_grammar(&grammar)
    }

    pub fn compile_regex(&self, pattern: &str) -> Result<Arc<CompiledGrammar>> {
        let grammar = Grammar::from_regex(pattern)?;
        self.compile_grammar(&grammar)
    }

    pub fn compile_structural_tag(&self, json: &str) -> Result<Arc<CompiledGrammar>> {
        let grammar = Grammar::from_structural_tag(json)?;
        self.compile_grammar(&grammar)
    }

    /// The built-in JSON grammar, compiled once per compiler.
    pub fn compile_builtin_json_grammar(&self) -> Result<Arc<CompiledGrammar>> {
        if let Some(compiled) = self.builtin_json.get() {
            return Ok(compiled.clone());
        }
        let grammar = Grammar::builtin_json_grammar()?;
        let compiled = self.compile_uncached(&grammar)?;
        Ok(self.builtin_json.get_or_init(|| compiled).clone())
    }

    /// Summed `memory_size` of the cached grammars, in bytes.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().total_bytes
    }

    /// The effective byte limit; `None` when unlimited.
    pub fn cache_limit(&self) -> Option<usize> {
        self.options.max_memory_bytes.filter(|&limit| limit > 0)
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.total_bytes = 0;
    }

    fn compile_uncached(&self, grammar: &Grammar) -> Result<Arc<CompiledGrammar>> {
        let start = Instant::now();
        let tokenizer_info = self.tokenizer_info.clone();
        let compiled = self.pool.install(|| CompiledGrammar::compile(grammar, tokenizer_info))?;
        tracing::info!(
            rules = grammar.num_rules(),
            bytes = compiled.memory_size(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "compiled grammar"
        );
        Ok(Arc::new(compiled))
    }

    /// Insert a freshly compiled grammar. If another thread cached the same
    /// key first, its entry is kept and returned.
    fn insert(&self, key: String, compiled: Arc<CompiledGrammar>) -> Arc<CompiledGrammar> {
        let size = compiled.memory_size();
        let mut cache = self.cache.lock();
        if let Some((existing, _)) = cache.entries.get(&key) {
            return existing.clone();
        }
        if let Some(limit) = self.cache_limit() {
            if size > limit {
                tracing::debug!(size, limit, "compiled grammar exceeds the cache limit, not cached");
                return compiled;
            }
            while cache.total_bytes + size > limit {
                let Some((_, (_, evicted_size))) = cache.entries.pop_lru() else {
                    break;
                };
                cache.total_bytes = cache.total_bytes.saturating_sub(evicted_size);
                tracing::debug!(evicted_size, total = cache.total_bytes, "evicted compiled grammar");
            }
        }
        cache.total_bytes += size;
        cache.entries.put(key, (compiled.clone(), size));
        compiled
    }
}
