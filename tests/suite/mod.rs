mod background;
mod dispatch;
mod round_trip;
mod shutdown;
