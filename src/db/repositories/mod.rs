mod actions;
mod activities;
mod events;
mod notes;
