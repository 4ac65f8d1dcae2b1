mod fetchers;
