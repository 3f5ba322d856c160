//! Web front-end running a pretrained object detection model on a live webcam stream or on
//! uploaded images.

pub mod camera;
pub mod config;
pub mod detector;
pub mod endpoints;
pub mod error;
pub mod ingest;
pub mod meter;
pub mod nn;
pub mod responder;
pub mod sensors;
pub mod views;
