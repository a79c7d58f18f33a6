// Frame command recording and the graphics pipeline

pub mod commands;
pub mod pipeline;
